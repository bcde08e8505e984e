//! Archive storage engine
//!
//! Single-writer SQLite archive in WAL mode with enforced foreign keys.
//! Contended writes back off exponentially (3 attempts, 1s/2s/4s) before
//! surfacing an error. Mutations never span a network call.

mod core;
mod forward;
mod hashes;
mod models;
mod schema;

pub use models::{
    ChannelAccess, ChannelForwardSchedule, Day, FileForwardSchedule, FileHashRow, ForwardStats,
    Media, Message, Month, QueueItem, QueueStatus, User,
};

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Busy-retry attempts before giving up on a statement
const RETRIES: u32 = 3;

/// Tables whose rows may be exported or integrity-checked by name.
/// Identifiers cannot be bound as SQL parameters, so everything else is
/// rejected up front.
const KNOWN_TABLES: &[&str] = &[
    "users",
    "media",
    "messages",
    "checkpoints",
    "account_channel_access",
    "file_hashes",
    "channel_file_inventory",
    "channel_forward_schedule",
    "channel_forward_stats",
    "file_forward_schedule",
    "file_forward_queue",
    "file_forward_stats",
    "category_to_group_mapping",
    "category_stats",
    "sorting_groups",
    "sorting_audit_log",
    "attribution_stats",
    "migration_progress",
];

/// SQLite-backed archive. All persisted rows are owned by this type; other
/// components query and submit changes through its methods only.
pub struct Archive {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Archive {
    /// Open (or create) the archive, enabling WAL and foreign keys and
    /// bootstrapping any missing tables. Schema changes are forward-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=RETRIES {
            match Self::try_open(&path) {
                Ok(conn) => {
                    info!("Archive ready at {}", path.display());
                    return Ok(Archive {
                        conn: Mutex::new(conn),
                        path,
                    });
                }
                Err(e) if is_busy(&e) && attempt < RETRIES => {
                    warn!(
                        "[{}/{}] archive locked, backing off {:?}",
                        attempt, RETRIES, backoff
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::DatabaseBusy { attempts: RETRIES })
    }

    fn try_open(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(conn)
    }

    /// Path the archive was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement under the single-writer lock, retrying on lock
    /// contention with exponential backoff.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=RETRIES {
            match f(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < RETRIES => {
                    debug!("[{}/{}] statement busy, sleeping {:?}", attempt, RETRIES, backoff);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::DatabaseBusy { attempts: RETRIES })
    }

    /// Reject table names outside the schema before splicing them into SQL.
    pub(crate) fn check_table(table: &str) -> Result<()> {
        if KNOWN_TABLES.contains(&table) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("unknown table: {}", table)))
        }
    }

    /// Export a table to CSV. Returns the number of rows written.
    pub fn export_csv<P: AsRef<Path>>(&self, table: &str, dst: P) -> Result<usize> {
        Self::check_table(table)?;
        let sql = format!("SELECT * FROM {}", table);
        let (headers, rows) = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let headers: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let width = headers.len();
            let mut rows: Vec<Vec<String>> = Vec::new();
            let mut query = stmt.query([])?;
            while let Some(row) = query.next()? {
                let mut fields = Vec::with_capacity(width);
                for i in 0..width {
                    let value: rusqlite::types::Value = row.get(i)?;
                    fields.push(match value {
                        rusqlite::types::Value::Null => String::new(),
                        rusqlite::types::Value::Integer(v) => v.to_string(),
                        rusqlite::types::Value::Real(v) => v.to_string(),
                        rusqlite::types::Value::Text(v) => v,
                        rusqlite::types::Value::Blob(v) => hex::encode(v),
                    });
                }
                rows.push(fields);
            }
            Ok((headers, rows))
        })?;

        let mut out = String::new();
        out.push_str(&headers.join(","));
        out.push('\n');
        for row in &rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        std::fs::write(dst.as_ref(), out)?;
        info!(
            "Exported {} rows from {} to {}",
            rows.len(),
            table,
            dst.as_ref().display()
        );
        Ok(rows.len())
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Current UTC timestamp in the column encoding used everywhere.
pub(crate) fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
pub(crate) fn test_archive() -> (tempfile::TempDir, Archive) {
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::open(dir.path().join("archive.sqlite3")).unwrap();
    (dir, archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let (dir, archive) = test_archive();
        drop(archive);
        // Re-open against the same file: schema bootstrap must not fail.
        let _again = Archive::open(dir.path().join("archive.sqlite3")).unwrap();
    }

    #[test]
    fn test_unknown_table_rejected() {
        let (_dir, archive) = test_archive();
        assert!(archive.export_csv("users; DROP TABLE users", "/tmp/x").is_err());
    }

    #[test]
    fn test_export_csv() {
        let (dir, archive) = test_archive();
        archive
            .upsert_user(&User {
                id: 7,
                username: Some("watcher".into()),
                first_name: None,
                last_name: None,
                tags: vec![],
                avatar: None,
            })
            .unwrap();
        let dst = dir.path().join("users.csv");
        assert_eq!(archive.export_csv("users", &dst).unwrap(), 1);
        let body = std::fs::read_to_string(&dst).unwrap();
        assert!(body.starts_with("id,"));
        assert!(body.contains("watcher"));
    }
}
