//! Message grouping
//!
//! Partitions an ascending-id message stream into forwarding units. The
//! filename strategy reunites multipart uploads (`vol.part1.rar`,
//! `vol.part2.rar`, ...) split across messages; the time strategy clusters
//! bursts from a single sender.

use crate::config::GroupingStrategy;
use regex::Regex;

/// Accessors the grouper needs from a message.
pub trait GroupItem {
    fn id(&self) -> i64;
    fn sender_id(&self) -> Option<i64>;
    /// Unix timestamp, seconds
    fn timestamp(&self) -> i64;
    fn filename(&self) -> Option<&str>;
}

/// Components of a filename with its part indicator isolated.
/// Re-composing `base + part + extension` yields the original name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameParts {
    pub base: String,
    pub part: String,
    pub part_number: u32,
    pub extension: String,
}

/// Multi-part extensions recognized before single-extension splitting
const MULTI_EXTENSIONS: [&str; 3] = [".tar.gz", ".tar.bz2", ".tar.xz"];

/// Split a filename into base, part indicator, and extension.
///
/// Recognized part indicators: trailing `.partN`, `_partN`, ` (N)`, `.N`,
/// `_N` (numeric forms up to four digits). A name whose "extension" is
/// itself a part indicator (`archive.part3`) yields an empty extension.
pub fn parse_filename(filename: &str) -> Option<FilenameParts> {
    if filename.is_empty() {
        return None;
    }

    let mut base = filename.to_string();
    let mut extension = String::new();

    let lower = filename.to_lowercase();
    for multi in MULTI_EXTENSIONS {
        if lower.ends_with(multi) {
            extension = filename[filename.len() - multi.len()..].to_string();
            base = filename[..filename.len() - multi.len()].to_string();
            break;
        }
    }

    if extension.is_empty() {
        if let Some(dot) = base.rfind('.') {
            extension = base[dot..].to_string();
            base = base[..dot].to_string();
        }
    }

    // An "extension" like ".part2" is really a part indicator.
    let ext_part = Regex::new(r"(?i)^\.part(\d+)$").unwrap();
    if let Some(caps) = ext_part.captures(&extension) {
        if let Ok(number) = caps[1].parse::<u32>() {
            return Some(FilenameParts {
                base,
                part: extension,
                part_number: number,
                extension: String::new(),
            });
        }
    }

    // Part indicators at the end of the base name, most specific first.
    let patterns = [
        Regex::new(r"(?i)(\.part(\d+))$").unwrap(),
        Regex::new(r"(?i)(_part(\d+))$").unwrap(),
        Regex::new(r"(?i)(\s\((\d+)\))$").unwrap(),
        Regex::new(r"(?i)(\.(\d{1,4}))$").unwrap(),
        Regex::new(r"(?i)(_(\d{1,4}))$").unwrap(),
    ];
    for pattern in &patterns {
        if let Some(caps) = pattern.captures(&base) {
            let part = caps.get(1).unwrap().as_str().to_string();
            let number: u32 = match caps[2].parse() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let stem = base[..base.len() - part.len()].to_string();
            if stem.is_empty() {
                // The whole base is the indicator ("_part1"): treat it as a
                // plain name with no part.
                break;
            }
            return Some(FilenameParts {
                base: stem,
                part,
                part_number: number,
                extension,
            });
        }
    }

    Some(FilenameParts {
        base,
        part: String::new(),
        part_number: 0,
        extension,
    })
}

/// Partition `messages` (ascending id order) into ordered groups.
///
/// The output is exhaustive and disjoint, preserves the total message
/// count, and orders groups by their first message id.
pub fn group_messages<M: GroupItem>(
    messages: Vec<M>,
    strategy: GroupingStrategy,
    time_window_seconds: u32,
) -> Vec<Vec<M>> {
    match strategy {
        GroupingStrategy::None => messages.into_iter().map(|m| vec![m]).collect(),
        GroupingStrategy::Time => group_by_time(messages, time_window_seconds),
        GroupingStrategy::Filename => group_by_filename(messages),
    }
}

fn group_by_time<M: GroupItem>(messages: Vec<M>, window: u32) -> Vec<Vec<M>> {
    let mut groups: Vec<Vec<M>> = Vec::new();
    let mut current: Vec<M> = Vec::new();

    for msg in messages {
        let breaks = match current.last() {
            None => false,
            Some(prev) => {
                prev.sender_id() != msg.sender_id()
                    || msg.timestamp() - prev.timestamp() > i64::from(window)
            }
        };
        if breaks {
            groups.push(std::mem::take(&mut current));
        }
        current.push(msg);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn group_by_filename<M: GroupItem>(messages: Vec<M>) -> Vec<Vec<M>> {
    // Key: (sender, lowercased base, lowercased extension). Preserve first-
    // seen order of keys so candidate groups stay deterministic.
    let mut keyed: Vec<((i64, String, String), Vec<M>)> = Vec::new();
    let mut lone: Vec<M> = Vec::new();

    for msg in messages {
        let parsed = msg
            .sender_id()
            .zip(msg.filename())
            .and_then(|(sender, name)| parse_filename(name).map(|p| (sender, p)));
        match parsed {
            Some((sender, parts)) if !parts.base.is_empty() && !parts.extension.is_empty() => {
                let key = (
                    sender,
                    parts.base.to_lowercase(),
                    parts.extension.to_lowercase(),
                );
                match keyed.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, members)) => members.push(msg),
                    None => keyed.push((key, vec![msg])),
                }
            }
            _ => lone.push(msg),
        }
    }

    let mut groups: Vec<Vec<M>> = Vec::new();
    for (_, mut members) in keyed {
        if members.len() > 1 {
            members.sort_by_key(|m| {
                let number = m
                    .filename()
                    .and_then(parse_filename)
                    .map(|p| p.part_number)
                    .unwrap_or(0);
                (number, m.id())
            });
            groups.push(members);
        } else {
            lone.append(&mut members);
        }
    }
    for msg in lone {
        groups.push(vec![msg]);
    }

    groups.sort_by_key(|g| g.first().map(GroupItem::id).unwrap_or(i64::MAX));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestMsg {
        id: i64,
        sender: Option<i64>,
        ts: i64,
        name: Option<String>,
    }

    impl GroupItem for TestMsg {
        fn id(&self) -> i64 {
            self.id
        }
        fn sender_id(&self) -> Option<i64> {
            self.sender
        }
        fn timestamp(&self) -> i64 {
            self.ts
        }
        fn filename(&self) -> Option<&str> {
            self.name.as_deref()
        }
    }

    fn msg(id: i64, sender: i64, ts: i64, name: &str) -> TestMsg {
        TestMsg {
            id,
            sender: Some(sender),
            ts,
            name: if name.is_empty() { None } else { Some(name.to_string()) },
        }
    }

    #[test]
    fn test_parse_multipart_rar() {
        let parts = parse_filename("vol.part1.rar").unwrap();
        assert_eq!(
            parts,
            FilenameParts {
                base: "vol".into(),
                part: ".part1".into(),
                part_number: 1,
                extension: ".rar".into(),
            }
        );
    }

    #[test]
    fn test_parse_variants() {
        for (name, base, part, number, ext) in [
            ("backup_part12.zip", "backup", "_part12", 12, ".zip"),
            ("photo (3).jpg", "photo", " (3)", 3, ".jpg"),
            ("dump.2.sql", "dump", ".2", 2, ".sql"),
            ("logs_7.txt", "logs", "_7", 7, ".txt"),
            ("archive.part3", "archive", ".part3", 3, ""),
            ("plain.zip", "plain", "", 0, ".zip"),
            ("data.tar.gz", "data", "", 0, ".tar.gz"),
            ("data_part2.tar.gz", "data", "_part2", 2, ".tar.gz"),
        ] {
            let parts = parse_filename(name).unwrap();
            assert_eq!(parts.base, base, "{}", name);
            assert_eq!(parts.part, part, "{}", name);
            assert_eq!(parts.part_number, number, "{}", name);
            assert_eq!(parts.extension, ext, "{}", name);
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for name in [
            "vol.part1.rar",
            "backup_part12.zip",
            "photo (3).jpg",
            "dump.2.sql",
            "logs_7.txt",
            "archive.part3",
            "plain.zip",
            "data.tar.gz",
            "Data_Part2.TAR.GZ",
            "noext",
            ".bashrc",
            "_part1",
        ] {
            let parts = parse_filename(name).unwrap();
            let recomposed = format!("{}{}{}", parts.base, parts.part, parts.extension);
            assert!(
                recomposed.eq_ignore_ascii_case(name),
                "{} -> {:?} -> {}",
                name,
                parts,
                recomposed
            );
        }
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert!(parse_filename("").is_none());
    }

    #[test]
    fn test_pure_indicator_name_is_its_own_base() {
        let parts = parse_filename("_part1").unwrap();
        assert_eq!(parts.base, "_part1");
        assert_eq!(parts.part_number, 0);
    }

    #[test]
    fn test_none_strategy_singletons() {
        let input = vec![msg(1, 1, 0, "a.zip"), msg(2, 1, 5, "b.zip")];
        let groups = group_messages(input.clone(), GroupingStrategy::None, 300);
        assert_eq!(groups.len(), 2);
        let flat: Vec<TestMsg> = groups.into_iter().flatten().collect();
        assert_eq!(flat, input);
    }

    #[test]
    fn test_time_grouping_breaks_on_sender_and_window() {
        // Seed scenario: (A,0) (A,30) (B,45) (A,60), window 120s.
        let input = vec![
            msg(1, 1, 0, ""),
            msg(2, 1, 30, ""),
            msg(3, 2, 45, ""),
            msg(4, 1, 60, ""),
        ];
        let groups = group_messages(input, GroupingStrategy::Time, 120);
        let ids: Vec<Vec<i64>> = groups
            .iter()
            .map(|g| g.iter().map(|m| m.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3], vec![4]]);
    }

    #[test]
    fn test_time_grouping_window_gap() {
        let input = vec![msg(1, 1, 0, ""), msg(2, 1, 121, "")];
        let groups = group_messages(input, GroupingStrategy::Time, 120);
        assert_eq!(groups.len(), 2);

        let input = vec![msg(1, 1, 0, ""), msg(2, 1, 120, "")];
        let groups = group_messages(input, GroupingStrategy::Time, 120);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_filename_grouping_multipart_seed() {
        // Seed scenario: ids 10..14 with a four-part rar plus a loner.
        let input = vec![
            msg(10, 1, 0, "vol.part1.rar"),
            msg(11, 1, 1, "vol.part2.rar"),
            msg(12, 1, 2, "vol.part3.rar"),
            msg(13, 1, 3, "vol.part4.rar"),
            msg(14, 1, 4, "other.zip"),
        ];
        let groups = group_messages(input, GroupingStrategy::Filename, 300);
        let ids: Vec<Vec<i64>> = groups
            .iter()
            .map(|g| g.iter().map(|m| m.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![10, 11, 12, 13], vec![14]]);
        assert_eq!(groups[0][0].id, 10, "representative id of first group");
    }

    #[test]
    fn test_filename_grouping_sorts_by_part_number() {
        // Parts uploaded out of order: part numbers win over ids.
        let input = vec![
            msg(20, 1, 0, "vol.part2.rar"),
            msg(21, 1, 1, "vol.part1.rar"),
        ];
        let groups = group_messages(input, GroupingStrategy::Filename, 300);
        assert_eq!(groups.len(), 1);
        let ids: Vec<i64> = groups[0].iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![21, 20]);
    }

    #[test]
    fn test_filename_grouping_separates_senders() {
        let input = vec![
            msg(1, 1, 0, "vol.part1.rar"),
            msg(2, 2, 0, "vol.part2.rar"),
        ];
        let groups = group_messages(input, GroupingStrategy::Filename, 300);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_filename_grouping_case_insensitive_key() {
        let input = vec![
            msg(1, 1, 0, "Vol.Part1.RAR"),
            msg(2, 1, 0, "vol.part2.rar"),
        ];
        let groups = group_messages(input, GroupingStrategy::Filename, 300);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_partition_laws_hold() {
        let input: Vec<TestMsg> = vec![
            msg(1, 1, 0, "a.part1.rar"),
            msg(2, 1, 10, "a.part2.rar"),
            msg(3, 2, 20, "b.zip"),
            msg(4, 1, 30, "noext"),
            msg(5, 3, 40, ""),
        ];
        for strategy in [
            GroupingStrategy::None,
            GroupingStrategy::Time,
            GroupingStrategy::Filename,
        ] {
            let groups = group_messages(input.clone(), strategy, 60);
            let mut all_ids: Vec<i64> =
                groups.iter().flatten().map(|m| m.id).collect();
            assert_eq!(all_ids.len(), input.len(), "{:?} lost messages", strategy);
            all_ids.sort_unstable();
            all_ids.dedup();
            assert_eq!(all_ids.len(), input.len(), "{:?} duplicated messages", strategy);

            // Groups ordered by first id.
            let firsts: Vec<i64> = groups.iter().map(|g| g[0].id).collect();
            let mut sorted = firsts.clone();
            sorted.sort_unstable();
            assert_eq!(firsts, sorted, "{:?} group order", strategy);
        }
    }
}
