//! Hash, inventory, attribution, and sorting operations.

use super::models::FileHashRow;
use super::{now_utc, Archive};
use crate::error::Result;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

impl Archive {
    // File hashes ----------------------------------------------------------

    /// Record hashes for a file identity. `file_id` is unique; a re-record
    /// for the same identity keeps the first row (same bytes, same hashes).
    pub fn add_file_hash(
        &self,
        file_id: &str,
        sha256: Option<&str>,
        perceptual: Option<&str>,
        fuzzy: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO file_hashes(file_id, sha256_hash, perceptual_hash, fuzzy_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![file_id, sha256, perceptual, fuzzy, now_utc()],
            )?;
            Ok(())
        })
    }

    pub fn file_hash(&self, file_id: &str) -> Result<Option<FileHashRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT file_id, sha256_hash, perceptual_hash, fuzzy_hash FROM file_hashes WHERE file_id = ?1",
                params![file_id],
                |row| {
                    Ok(FileHashRow {
                        file_id: row.get(0)?,
                        sha256: row.get(1)?,
                        perceptual: row.get(2)?,
                        fuzzy: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Exact-match lookup, optionally scoped to files already seen in one
    /// channel.
    pub fn sha256_exists(&self, sha256: &str, channel_scope: Option<i64>) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = match channel_scope {
                Some(channel_id) => conn
                    .query_row(
                        "SELECT 1 FROM file_hashes f
                         JOIN channel_file_inventory c ON f.file_id = c.file_id
                         WHERE f.sha256_hash = ?1 AND c.channel_id = ?2
                         LIMIT 1",
                        params![sha256, channel_id],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        "SELECT 1 FROM file_hashes WHERE sha256_hash = ?1 LIMIT 1",
                        params![sha256],
                        |row| row.get(0),
                    )
                    .optional()?,
            };
            Ok(found.is_some())
        })
    }

    /// Stream every known SHA-256 into a set. The in-memory fingerprint set
    /// is strictly a cache of this table.
    pub fn load_sha256_set(&self) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT sha256_hash FROM file_hashes WHERE sha256_hash IS NOT NULL")?;
            let set = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(set)
        })
    }

    pub fn all_perceptual_hashes(&self, channel_scope: Option<i64>) -> Result<Vec<(String, String)>> {
        self.hash_column("perceptual_hash", channel_scope)
    }

    pub fn all_fuzzy_hashes(&self, channel_scope: Option<i64>) -> Result<Vec<(String, String)>> {
        self.hash_column("fuzzy_hash", channel_scope)
    }

    fn hash_column(&self, column: &str, channel_scope: Option<i64>) -> Result<Vec<(String, String)>> {
        debug_assert!(matches!(column, "perceptual_hash" | "fuzzy_hash"));
        self.with_conn(|conn| {
            let rows = match channel_scope {
                Some(channel_id) => {
                    let sql = format!(
                        "SELECT f.file_id, f.{col} FROM file_hashes f
                         JOIN channel_file_inventory c ON f.file_id = c.file_id
                         WHERE f.{col} IS NOT NULL AND c.channel_id = ?1",
                        col = column
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![channel_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let sql = format!(
                        "SELECT file_id, {col} FROM file_hashes WHERE {col} IS NOT NULL",
                        col = column
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    // Channel file inventory -----------------------------------------------

    /// Record that a file appeared in a channel. Ignored on conflict so the
    /// (channel, file, message) triple stays unique.
    pub fn add_channel_file_inventory(
        &self,
        channel_id: i64,
        file_id: &str,
        message_id: i64,
        topic_id: Option<i64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO channel_file_inventory(channel_id, file_id, message_id, topic_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![channel_id, file_id, message_id, topic_id, now_utc()],
            )?;
            Ok(())
        })
    }

    pub fn inventory_count(&self, channel_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM channel_file_inventory WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
        })
    }

    // Attribution stats ----------------------------------------------------

    pub fn update_attribution_stats(&self, source_channel_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO attribution_stats(source_channel_id, attributions_count)
                 VALUES (?1, 1)
                 ON CONFLICT(source_channel_id) DO UPDATE SET
                     attributions_count = attributions_count + 1",
                params![source_channel_id],
            )?;
            Ok(())
        })
    }

    pub fn attribution_count(&self, source_channel_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT attributions_count FROM attribution_stats WHERE source_channel_id = ?1",
                params![source_channel_id],
                |row| row.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
        })
    }

    // Category / sorting ---------------------------------------------------

    pub fn add_category_to_group_mapping(&self, category: &str, group_id: i64, priority: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO category_to_group_mapping(category, group_id, priority) VALUES (?1, ?2, ?3)",
                params![category, group_id, priority],
            )?;
            Ok(())
        })
    }

    pub fn group_id_for_category(&self, category: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT group_id FROM category_to_group_mapping WHERE category = ?1 ORDER BY priority DESC LIMIT 1",
                params![category],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn update_category_stats(&self, category: &str, file_size: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO category_stats(category, files_count, bytes_count)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(category) DO UPDATE SET
                     files_count = files_count + 1,
                     bytes_count = bytes_count + excluded.bytes_count",
                params![category, file_size],
            )?;
            Ok(())
        })
    }

    pub fn add_sorting_group(&self, group_name: &str, template: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sorting_groups(group_name, template) VALUES (?1, ?2)",
                params![group_name, template],
            )?;
            Ok(())
        })
    }

    pub fn sorting_group_template(&self, group_name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT template FROM sorting_groups WHERE group_name = ?1",
                params![group_name],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn add_sorting_audit_log(
        &self,
        source: &str,
        message_id: i64,
        file_id: &str,
        category: &str,
        group_id: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sorting_audit_log(source, message_id, file_id, category, group_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![source, message_id, file_id, category, group_id, now_utc()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_archive;

    #[test]
    fn test_file_hash_idempotent_on_file_id() {
        let (_dir, archive) = test_archive();
        archive
            .add_file_hash("file-1", Some("aa".repeat(32).as_str()), Some("0f0f"), None)
            .unwrap();
        archive
            .add_file_hash("file-1", Some("bb".repeat(32).as_str()), None, None)
            .unwrap();

        let row = archive.file_hash("file-1").unwrap().unwrap();
        assert_eq!(row.sha256.unwrap(), "aa".repeat(32));
        assert_eq!(row.perceptual.as_deref(), Some("0f0f"));
    }

    #[test]
    fn test_sha256_scope() {
        let (_dir, archive) = test_archive();
        let hash = "cd".repeat(32);
        archive.add_file_hash("file-9", Some(&hash), None, None).unwrap();
        archive.add_channel_file_inventory(100, "file-9", 1, None).unwrap();

        assert!(archive.sha256_exists(&hash, None).unwrap());
        assert!(archive.sha256_exists(&hash, Some(100)).unwrap());
        assert!(!archive.sha256_exists(&hash, Some(200)).unwrap());
        assert!(!archive.sha256_exists("ff", None).unwrap());
    }

    #[test]
    fn test_load_sha256_set_matches_table() {
        let (_dir, archive) = test_archive();
        archive.add_file_hash("a", Some("h1"), None, None).unwrap();
        archive.add_file_hash("b", Some("h2"), None, Some("fz")).unwrap();
        archive.add_file_hash("c", None, Some("pp"), None).unwrap();

        let set = archive.load_sha256_set().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("h1") && set.contains("h2"));
    }

    #[test]
    fn test_near_hash_listings_scoped() {
        let (_dir, archive) = test_archive();
        archive.add_file_hash("a", Some("h1"), Some("p1"), Some("f1")).unwrap();
        archive.add_file_hash("b", Some("h2"), Some("p2"), None).unwrap();
        archive.add_channel_file_inventory(1, "a", 10, None).unwrap();

        assert_eq!(archive.all_perceptual_hashes(None).unwrap().len(), 2);
        assert_eq!(archive.all_perceptual_hashes(Some(1)).unwrap().len(), 1);
        assert_eq!(archive.all_fuzzy_hashes(None).unwrap().len(), 1);
        assert_eq!(archive.all_fuzzy_hashes(Some(2)).unwrap().len(), 0);
    }

    #[test]
    fn test_inventory_unique_on_triple() {
        let (_dir, archive) = test_archive();
        for _ in 0..3 {
            archive.add_channel_file_inventory(5, "f", 77, Some(2)).unwrap();
        }
        archive.add_channel_file_inventory(5, "f", 78, Some(2)).unwrap();
        assert_eq!(archive.inventory_count(5).unwrap(), 2);
    }

    #[test]
    fn test_attribution_counter() {
        let (_dir, archive) = test_archive();
        assert_eq!(archive.attribution_count(123).unwrap(), 0);
        archive.update_attribution_stats(123).unwrap();
        archive.update_attribution_stats(123).unwrap();
        assert_eq!(archive.attribution_count(123).unwrap(), 2);
    }

    #[test]
    fn test_category_mapping_and_stats() {
        let (_dir, archive) = test_archive();
        archive.add_category_to_group_mapping("ebooks", 10, 0).unwrap();
        archive.add_category_to_group_mapping("ebooks", 20, 5).unwrap();
        assert_eq!(archive.group_id_for_category("ebooks").unwrap(), Some(20));
        assert_eq!(archive.group_id_for_category("video").unwrap(), None);

        archive.update_category_stats("ebooks", 100).unwrap();
        archive.update_category_stats("ebooks", 50).unwrap();
        let (files, bytes): (i64, i64) = archive
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT files_count, bytes_count FROM category_stats WHERE category = 'ebooks'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!((files, bytes), (2, 150));
    }
}
