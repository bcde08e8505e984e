//! Core archive operations: users, media, messages, checkpoints,
//! account/channel visibility, and timeline queries.

use super::models::{ChannelAccess, Day, Media, Message, Month, User};
use super::{now_utc, Archive};
use crate::error::{Error, Result};
use rusqlite::{params, OptionalExtension};
use tracing::info;

impl Archive {
    // Users ----------------------------------------------------------------

    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users(id, username, first_name, last_name, tags, avatar, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     username=excluded.username,
                     first_name=excluded.first_name,
                     last_name=excluded.last_name,
                     tags=excluded.tags,
                     avatar=excluded.avatar,
                     last_updated=excluded.last_updated",
                params![
                    user.id,
                    user.username,
                    user.first_name,
                    user.last_name,
                    user.tags.join(" "),
                    user.avatar,
                    now_utc(),
                ],
            )?;
            Ok(())
        })
    }

    // Media ----------------------------------------------------------------

    pub fn upsert_media(&self, media: &Media) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO media(id, type, url, title, description, thumb, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     type=excluded.type,
                     url=excluded.url,
                     title=excluded.title,
                     description=excluded.description,
                     thumb=excluded.thumb,
                     checksum=excluded.checksum",
                params![
                    media.id,
                    media.media_type,
                    media.url,
                    media.title,
                    media.description,
                    media.thumb,
                    media.checksum,
                ],
            )?;
            Ok(())
        })
    }

    // Messages -------------------------------------------------------------

    /// Upsert a message row. Only the user/media ids are stored. A row that
    /// already carries a checksum is immutable in its (id, checksum) pair:
    /// a rewrite with a different checksum is rejected.
    pub fn upsert_message(&self, msg: &Message) -> Result<()> {
        let existing: Option<Option<String>> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT checksum FROM messages WHERE id = ?1",
                params![msg.id],
                |row| row.get(0),
            )
            .optional()
        })?;

        if let Some(Some(stored)) = existing {
            match &msg.checksum {
                Some(checksum) if checksum == &stored => {}
                Some(checksum) => {
                    return Err(Error::ChecksumMismatch {
                        id: msg.id,
                        expected: stored,
                        got: checksum.clone(),
                    })
                }
                None => {
                    return Err(Error::ChecksumMismatch {
                        id: msg.id,
                        expected: stored,
                        got: String::new(),
                    })
                }
            }
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages(id, type, date, edit_date, content, reply_to, user_id, media_id, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     type=excluded.type,
                     date=excluded.date,
                     edit_date=excluded.edit_date,
                     content=excluded.content,
                     reply_to=excluded.reply_to,
                     user_id=excluded.user_id,
                     media_id=excluded.media_id,
                     checksum=excluded.checksum",
                params![
                    msg.id,
                    msg.message_type,
                    msg.date.to_rfc3339(),
                    msg.edit_date.map(|d| d.to_rfc3339()),
                    msg.content,
                    msg.reply_to,
                    msg.user.as_ref().map(|u| u.id),
                    msg.media.as_ref().map(|m| m.id),
                    msg.checksum,
                ],
            )?;
            Ok(())
        })
    }

    pub fn message_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        })
    }

    // Checkpoints ----------------------------------------------------------

    /// Append a checkpoint for (entity, context). The log is append-only;
    /// the current checkpoint is the latest by time.
    pub fn save_checkpoint(&self, entity: &str, context: &str, last_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints(entity, context, last_message_id, checkpoint_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entity, context, last_id, now_utc()],
            )?;
            Ok(())
        })?;
        info!("Checkpoint saved ({} - {}:{})", last_id, entity, context);
        Ok(())
    }

    pub fn latest_checkpoint(&self, entity: &str, context: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_message_id FROM checkpoints
                 WHERE entity = ?1 AND context = ?2
                 ORDER BY checkpoint_time DESC, id DESC LIMIT 1",
                params![entity, context],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // Account / channel visibility ------------------------------------------

    pub fn upsert_account_channel_access(
        &self,
        account_phone: &str,
        channel_id: i64,
        channel_name: Option<&str>,
        access_hash: Option<i64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO account_channel_access(account_phone_number, channel_id, channel_name, access_hash, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_phone_number, channel_id) DO UPDATE SET
                     channel_name=excluded.channel_name,
                     access_hash=excluded.access_hash,
                     last_seen=excluded.last_seen",
                params![account_phone, channel_id, channel_name, access_hash, now_utc()],
            )?;
            Ok(())
        })
    }

    /// Every known channel paired with the account best placed to read it:
    /// presence of an access hash wins, then recency.
    pub fn get_all_unique_channels(&self) -> Result<Vec<ChannelAccess>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_id, account_phone_number
                 FROM (
                     SELECT
                         channel_id,
                         account_phone_number,
                         ROW_NUMBER() OVER (
                             PARTITION BY channel_id
                             ORDER BY CASE WHEN access_hash IS NOT NULL THEN 0 ELSE 1 END,
                                      last_seen DESC
                         ) AS rn
                     FROM account_channel_access
                 )
                 WHERE rn = 1
                 ORDER BY channel_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ChannelAccess {
                        channel_id: row.get(0)?,
                        account_phone: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // Timeline helpers -----------------------------------------------------

    /// Message counts per month, ascending.
    pub fn months(&self) -> Result<Vec<Month>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m', date) AS slug, COUNT(*)
                 FROM messages GROUP BY slug ORDER BY slug",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Month {
                        slug: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Message counts per day of a month, with the timeline page of the
    /// day's first message (page = ceil(rank / page_size)).
    pub fn days(&self, year: i32, month: u32, page_size: i64) -> Result<Vec<Day>> {
        let ym = format!("{:04}{:02}", year, month);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m-%d', date) AS slug,
                        COUNT(*),
                        (MIN(rn) + ?1 - 1) / ?1
                 FROM (
                     SELECT ROW_NUMBER() OVER (ORDER BY id) AS rn, date
                     FROM messages WHERE strftime('%Y%m', date) = ?2
                 )
                 GROUP BY slug ORDER BY slug",
            )?;
            let rows = stmt
                .query_map(params![page_size, ym], |row| {
                    Ok(Day {
                        slug: row.get(0)?,
                        count: row.get(1)?,
                        page: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // Integrity ------------------------------------------------------------

    /// List rows with missing checksums. A minimal canary; deeper integrity
    /// sweeps are operator-driven.
    pub fn verify_checksums(
        &self,
        table: &str,
        id_range: Option<(i64, i64)>,
    ) -> Result<Vec<(i64, String)>> {
        Self::check_table(table)?;
        let mut sql = format!("SELECT id, checksum FROM {}", table);
        if id_range.is_some() {
            sql.push_str(" WHERE id BETWEEN ?1 AND ?2");
        }
        let issues = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mapper = |row: &rusqlite::Row<'_>| {
                let id: i64 = row.get(0)?;
                let checksum: Option<String> = row.get(1)?;
                Ok((id, checksum))
            };
            let rows: Vec<(i64, Option<String>)> = match id_range {
                Some((lo, hi)) => stmt
                    .query_map(params![lo, hi], mapper)?
                    .collect::<rusqlite::Result<_>>()?,
                None => stmt.query_map([], mapper)?.collect::<rusqlite::Result<_>>()?,
            };
            Ok(rows)
        })?;

        let issues: Vec<(i64, String)> = issues
            .into_iter()
            .filter(|(_, checksum)| checksum.as_deref().unwrap_or("").is_empty())
            .map(|(id, _)| (id, "missing checksum".to_string()))
            .collect();
        info!("Integrity on {}: {} issue(s)", table, issues.len());
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_archive;
    use super::*;
    use chrono::TimeZone;

    fn message(id: i64, date: chrono::DateTime<chrono::Utc>) -> Message {
        Message {
            id,
            message_type: "message".into(),
            date,
            edit_date: None,
            content: Some(format!("payload {}", id)),
            reply_to: None,
            user: None,
            media: None,
            checksum: Some(format!("{:064x}", id)),
        }
    }

    #[test]
    fn test_upsert_user_idempotent() {
        let (_dir, archive) = test_archive();
        let user = User {
            id: 1,
            username: Some("alpha".into()),
            first_name: Some("A".into()),
            last_name: None,
            tags: vec!["seed".into()],
            avatar: None,
        };
        archive.upsert_user(&user).unwrap();
        archive.upsert_user(&user).unwrap();
        let count: i64 = archive
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upsert_message_idempotent_and_checksum_locked() {
        let (_dir, archive) = test_archive();
        let date = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let msg = message(10, date);
        archive.upsert_message(&msg).unwrap();
        archive.upsert_message(&msg).unwrap();
        assert_eq!(archive.message_count().unwrap(), 1);

        let mut tampered = msg.clone();
        tampered.checksum = Some("different".into());
        assert!(matches!(
            archive.upsert_message(&tampered),
            Err(crate::error::Error::ChecksumMismatch { id: 10, .. })
        ));
    }

    #[test]
    fn test_message_upsert_stores_foreign_ids() {
        let (_dir, archive) = test_archive();
        let user = User {
            id: 5,
            username: None,
            first_name: None,
            last_name: None,
            tags: vec![],
            avatar: None,
        };
        let media = Media {
            id: 9,
            media_type: "document".into(),
            url: None,
            title: None,
            description: None,
            thumb: None,
            checksum: None,
        };
        archive.upsert_user(&user).unwrap();
        archive.upsert_media(&media).unwrap();

        let date = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut msg = message(11, date);
        msg.user = Some(user);
        msg.media = Some(media);
        archive.upsert_message(&msg).unwrap();

        let (user_id, media_id): (i64, i64) = archive
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT user_id, media_id FROM messages WHERE id = 11",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!((user_id, media_id), (5, 9));
    }

    #[test]
    fn test_checkpoint_latest_wins() {
        let (_dir, archive) = test_archive();
        assert_eq!(archive.latest_checkpoint("@chan", "sync").unwrap(), None);
        archive.save_checkpoint("@chan", "sync", 100).unwrap();
        archive.save_checkpoint("@chan", "sync", 250).unwrap();
        archive.save_checkpoint("@chan", "scan", 10).unwrap();
        assert_eq!(
            archive.latest_checkpoint("@chan", "sync").unwrap(),
            Some(250)
        );
        assert_eq!(archive.latest_checkpoint("@chan", "scan").unwrap(), Some(10));
        assert_eq!(archive.latest_checkpoint("@other", "sync").unwrap(), None);
    }

    #[test]
    fn test_unique_channels_prefer_access_hash_then_recency() {
        let (_dir, archive) = test_archive();
        archive
            .upsert_account_channel_access("+1555000001", 42, Some("alpha"), None)
            .unwrap();
        archive
            .upsert_account_channel_access("+1555000002", 42, Some("alpha"), Some(777))
            .unwrap();
        archive
            .upsert_account_channel_access("+1555000003", 99, None, None)
            .unwrap();

        let channels = archive.get_all_unique_channels().unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel_id, 42);
        assert_eq!(channels[0].account_phone, "+1555000002");
        assert_eq!(channels[1].channel_id, 99);
    }

    #[test]
    fn test_timeline_months_and_days() {
        let (_dir, archive) = test_archive();
        for (id, day) in [(1, 1), (2, 1), (3, 2), (4, 15)] {
            let date = chrono::Utc.with_ymd_and_hms(2024, 5, day, 8, 0, 0).unwrap();
            archive.upsert_message(&message(id, date)).unwrap();
        }
        let june = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        archive.upsert_message(&message(5, june)).unwrap();

        let months = archive.months().unwrap();
        assert_eq!(
            months,
            vec![
                Month { slug: "2024-05".into(), count: 4 },
                Month { slug: "2024-06".into(), count: 1 },
            ]
        );

        let days = archive.days(2024, 5, 2).unwrap();
        assert_eq!(
            days,
            vec![
                Day { slug: "2024-05-01".into(), count: 2, page: 1 },
                Day { slug: "2024-05-02".into(), count: 1, page: 2 },
                Day { slug: "2024-05-15".into(), count: 1, page: 2 },
            ]
        );
    }

    #[test]
    fn test_verify_checksums_flags_empty_rows() {
        let (_dir, archive) = test_archive();
        let date = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        archive.upsert_message(&message(1, date)).unwrap();
        let mut bare = message(2, date);
        bare.checksum = None;
        archive.upsert_message(&bare).unwrap();

        let issues = archive.verify_checksums("messages", None).unwrap();
        assert_eq!(issues, vec![(2, "missing checksum".to_string())]);

        let scoped = archive.verify_checksums("messages", Some((1, 1))).unwrap();
        assert!(scoped.is_empty());
    }
}
