//! Row types for the archive database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Archived sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub tags: Vec<String>,
    pub avatar: Option<String>,
}

/// Archived media descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: i64,
    pub media_type: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumb: Option<String>,
    pub checksum: Option<String>,
}

/// Archived message. The row stores only the user/media ids; the full
/// structures are upserted separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub message_type: String,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub reply_to: Option<i64>,
    pub user: Option<User>,
    pub media: Option<Media>,
    pub checksum: Option<String>,
}

/// One month of archived traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Month {
    /// `YYYY-MM`
    pub slug: String,
    pub count: i64,
}

/// One day of archived traffic with its timeline page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Day {
    /// `YYYY-MM-DD`
    pub slug: String,
    pub count: i64,
    pub page: i64,
}

/// Channel visible to an account, with the freshest resolution data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccess {
    pub channel_id: i64,
    pub account_phone: String,
}

/// Persistent hashes for one upstream file identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashRow {
    pub file_id: String,
    pub sha256: Option<String>,
    pub perceptual: Option<String>,
    pub fuzzy: Option<String>,
}

/// Cron-driven channel mirror rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelForwardSchedule {
    pub id: i64,
    pub channel_id: i64,
    pub destination: String,
    pub schedule: String,
    pub last_message_id: i64,
    pub is_enabled: bool,
}

/// Cron-driven file forwarding rule with content filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileForwardSchedule {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub schedule: String,
    /// Comma-separated MIME whitelist; empty means any
    pub file_types: Option<String>,
    pub min_file_size: Option<i64>,
    pub max_file_size: Option<i64>,
    pub priority: i64,
    pub last_message_id: i64,
    pub is_enabled: bool,
}

impl FileForwardSchedule {
    /// True when a file with this MIME type and size passes the filters.
    pub fn accepts(&self, mime: Option<&str>, size: i64) -> bool {
        if let Some(types) = &self.file_types {
            if !types.is_empty() {
                let allowed = types.split(',').any(|t| Some(t.trim()) == mime);
                if !allowed {
                    return false;
                }
            }
        }
        if let Some(min) = self.min_file_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_file_size {
            if size > max {
                return false;
            }
        }
        true
    }
}

/// Lifecycle of a queued file forward. A row moves out of `Pending` exactly
/// once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Success,
    Error(String),
}

impl QueueStatus {
    pub fn as_db_string(&self) -> String {
        match self {
            QueueStatus::Pending => "pending".to_string(),
            QueueStatus::Success => "success".to_string(),
            QueueStatus::Error(reason) => format!("error: {}", reason),
        }
    }

    pub fn from_db_string(s: &str) -> Self {
        match s {
            "pending" => QueueStatus::Pending,
            "success" => QueueStatus::Success,
            other => QueueStatus::Error(
                other.strip_prefix("error: ").unwrap_or(other).to_string(),
            ),
        }
    }
}

/// One pending unit of work in the file forward queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub message_id: i64,
    pub file_id: String,
    pub destination: Option<String>,
}

/// Counters returned by every forwarding operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub messages_forwarded: u64,
    pub files_forwarded: u64,
    pub bytes_forwarded: u64,
}

impl ForwardStats {
    pub fn merge(&mut self, other: &ForwardStats) {
        self.messages_forwarded += other.messages_forwarded;
        self.files_forwarded += other.files_forwarded;
        self.bytes_forwarded += other.bytes_forwarded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Success,
            QueueStatus::Error("schedule not found".into()),
        ] {
            let rendered = status.as_db_string();
            assert_eq!(QueueStatus::from_db_string(&rendered), status);
        }
    }

    #[test]
    fn test_schedule_filters() {
        let schedule = FileForwardSchedule {
            id: 1,
            source: "@src".into(),
            destination: "@dst".into(),
            schedule: "* * * * * *".into(),
            file_types: Some("image/png,application/zip".into()),
            min_file_size: Some(1024),
            max_file_size: Some(4096),
            priority: 0,
            last_message_id: 0,
            is_enabled: true,
        };
        assert!(schedule.accepts(Some("image/png"), 2048));
        assert!(!schedule.accepts(Some("image/jpeg"), 2048));
        assert!(!schedule.accepts(Some("image/png"), 100));
        assert!(!schedule.accepts(Some("image/png"), 10_000));
        assert!(!schedule.accepts(None, 2048));
    }

    #[test]
    fn test_schedule_without_filters_accepts_everything() {
        let schedule = FileForwardSchedule {
            id: 1,
            source: "@src".into(),
            destination: "@dst".into(),
            schedule: "* * * * * *".into(),
            file_types: None,
            min_file_size: None,
            max_file_size: None,
            priority: 0,
            last_message_id: 0,
            is_enabled: true,
        };
        assert!(schedule.accepts(None, 0));
        assert!(schedule.accepts(Some("anything/at-all"), i64::MAX));
    }
}
