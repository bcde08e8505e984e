//! Schedule and work-queue operations for channel and file forwarding.

use super::models::{ChannelForwardSchedule, FileForwardSchedule, QueueItem, QueueStatus};
use super::{now_utc, Archive};
use crate::error::{Error, Result};
use rusqlite::{params, OptionalExtension};

impl Archive {
    // Channel forward schedules --------------------------------------------

    pub fn add_channel_forward_schedule(
        &self,
        channel_id: i64,
        destination: &str,
        schedule: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_forward_schedule(channel_id, destination, schedule, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![channel_id, destination, schedule, now_utc()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn channel_forward_schedules(&self) -> Result<Vec<ChannelForwardSchedule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, destination, schedule, last_message_id, is_enabled
                 FROM channel_forward_schedule WHERE is_enabled = 1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ChannelForwardSchedule {
                        id: row.get(0)?,
                        channel_id: row.get(1)?,
                        destination: row.get(2)?,
                        schedule: row.get(3)?,
                        last_message_id: row.get(4)?,
                        is_enabled: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn update_channel_forward_watermark(&self, schedule_id: i64, last_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE channel_forward_schedule SET last_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![last_id, now_utc(), schedule_id],
            )?;
            Ok(())
        })
    }

    pub fn add_channel_forward_stats(
        &self,
        schedule_id: i64,
        messages: u64,
        files: u64,
        bytes: u64,
        started_at: &str,
        status: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_forward_stats(schedule_id, messages_forwarded, files_forwarded, bytes_forwarded, started_at, finished_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    schedule_id,
                    messages as i64,
                    files as i64,
                    bytes as i64,
                    started_at,
                    now_utc(),
                    status
                ],
            )?;
            Ok(())
        })
    }

    // File forward schedules -----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_file_forward_schedule(
        &self,
        source: &str,
        destination: &str,
        schedule: &str,
        file_types: Option<&str>,
        min_file_size: Option<i64>,
        max_file_size: Option<i64>,
        priority: i64,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_forward_schedule(source, destination, schedule, file_types, min_file_size, max_file_size, priority, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    source,
                    destination,
                    schedule,
                    file_types,
                    min_file_size,
                    max_file_size,
                    priority,
                    now_utc()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Enabled schedules, highest priority first.
    pub fn file_forward_schedules(&self) -> Result<Vec<FileForwardSchedule>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source, destination, schedule, file_types, min_file_size, max_file_size, priority, last_message_id, is_enabled
                 FROM file_forward_schedule WHERE is_enabled = 1 ORDER BY priority DESC, id",
            )?;
            let rows = stmt
                .query_map([], map_file_schedule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn file_forward_schedule_by_id(&self, id: i64) -> Result<FileForwardSchedule> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source, destination, schedule, file_types, min_file_size, max_file_size, priority, last_message_id, is_enabled
                 FROM file_forward_schedule WHERE id = ?1",
                params![id],
                map_file_schedule,
            )
            .optional()
        })?
        .ok_or(Error::ScheduleNotFound(id))
    }

    pub fn set_file_forward_schedule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE file_forward_schedule SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled, now_utc(), id],
            )
        })?;
        if changed == 0 {
            return Err(Error::ScheduleNotFound(id));
        }
        Ok(())
    }

    /// Watermark update; written only after a full group was forwarded and
    /// recorded.
    pub fn update_file_forward_watermark(&self, schedule_id: i64, last_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE file_forward_schedule SET last_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![last_id, now_utc(), schedule_id],
            )?;
            Ok(())
        })
    }

    // File forward queue ---------------------------------------------------

    pub fn add_to_file_forward_queue(
        &self,
        schedule_id: Option<i64>,
        message_id: i64,
        file_id: &str,
        destination: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_forward_queue(schedule_id, message_id, file_id, destination, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
                params![schedule_id, message_id, file_id, destination, now_utc()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Pending work in strict priority-then-id order. Rows without a
    /// schedule sort as priority 0.
    pub fn pending_file_forward_queue(&self) -> Result<Vec<QueueItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT q.id, q.schedule_id, q.message_id, q.file_id, q.destination
                 FROM file_forward_queue q
                 LEFT JOIN file_forward_schedule s ON s.id = q.schedule_id
                 WHERE q.status = 'pending'
                 ORDER BY COALESCE(s.priority, 0) DESC, q.id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(QueueItem {
                        id: row.get(0)?,
                        schedule_id: row.get(1)?,
                        message_id: row.get(2)?,
                        file_id: row.get(3)?,
                        destination: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Transition a queue row out of `pending`. Rows that already settled
    /// are left untouched so a row settles exactly once.
    pub fn update_file_forward_queue_status(&self, queue_id: i64, status: &QueueStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE file_forward_queue SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![status.as_db_string(), now_utc(), queue_id],
            )?;
            Ok(())
        })
    }

    pub fn queue_status_by_schedule(&self, schedule_id: i64) -> Result<Vec<(i64, String, QueueStatus)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, file_id, status FROM file_forward_queue WHERE schedule_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![schedule_id], |row| {
                    let status: String = row.get(2)?;
                    Ok((row.get(0)?, row.get(1)?, QueueStatus::from_db_string(&status)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn add_file_forward_stats(
        &self,
        schedule_id: Option<i64>,
        files: u64,
        bytes: u64,
        started_at: &str,
        status: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_forward_stats(schedule_id, files_forwarded, bytes_forwarded, started_at, finished_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    schedule_id.unwrap_or(0),
                    files as i64,
                    bytes as i64,
                    started_at,
                    now_utc(),
                    status
                ],
            )?;
            Ok(())
        })
    }

    // Migration progress ---------------------------------------------------

    pub fn add_migration_progress(&self, source: &str, destination: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO migration_progress(source, destination, updated_at) VALUES (?1, ?2, ?3)",
                params![source, destination, now_utc()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_migration_progress(&self, id: i64, last_id: i64, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE migration_progress SET last_message_id = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![last_id, status, now_utc(), id],
            )?;
            Ok(())
        })
    }
}

fn map_file_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileForwardSchedule> {
    Ok(FileForwardSchedule {
        id: row.get(0)?,
        source: row.get(1)?,
        destination: row.get(2)?,
        schedule: row.get(3)?,
        file_types: row.get(4)?,
        min_file_size: row.get(5)?,
        max_file_size: row.get(6)?,
        priority: row.get(7)?,
        last_message_id: row.get(8)?,
        is_enabled: row.get(9)?,
    })
}
