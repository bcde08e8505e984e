//! Error types for tgrelay

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error category used by the recovery core to pick a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Auth,
    Permission,
    DataIntegrity,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::DataIntegrity => "data_integrity",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Severity attached to an error occurrence when logged or persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Main error type for tgrelay
#[derive(Error, Debug)]
pub enum Error {
    // Config errors
    #[error("Configuration error in '{field}': {reason}")]
    Config { field: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    // Telegram errors
    #[error("Telegram client error: {0}")]
    TelegramClient(String),

    #[error("Account not authorized: {0}")]
    AuthRequired(String),

    #[error("Rate limited, retry after {seconds} seconds")]
    RateLimited { seconds: u32 },

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Forwarding restricted by source: {0}")]
    ForwardRestricted(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Archive errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database busy after {attempts} attempts")]
    DatabaseBusy { attempts: u32 },

    #[error("Checksum mismatch for row {id}: expected {expected}, got {got}")]
    ChecksumMismatch {
        id: i64,
        expected: String,
        got: String,
    },

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(i64),

    // Dedup errors
    #[error("Hashing error: {0}")]
    Hashing(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category used by the retry/recovery policy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::RateLimited { .. } => ErrorCategory::RateLimit,
            Error::AuthRequired(_) => ErrorCategory::Auth,
            Error::Permission(_) | Error::ForwardRestricted(_) => ErrorCategory::Permission,
            Error::Network(_) | Error::Timeout(_) => ErrorCategory::Network,
            Error::Database(_) | Error::ChecksumMismatch { .. } => ErrorCategory::DataIntegrity,
            Error::Config { .. }
            | Error::InvalidConfig(_)
            | Error::AccountNotFound(_)
            | Error::EntityNotFound(_)
            | Error::ScheduleNotFound(_)
            | Error::DatabaseBusy { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Cancelled => ErrorCategory::System,
            Error::TelegramClient(_)
            | Error::Download(_)
            | Error::Upload(_)
            | Error::Hashing(_)
            | Error::Internal(_) => ErrorCategory::Unknown,
        }
    }

    /// Severity for logging and reports.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Cancelled => Severity::Info,
            _ => match self.category() {
                ErrorCategory::Auth => Severity::Critical,
                ErrorCategory::RateLimit | ErrorCategory::Network => Severity::Warning,
                _ => Severity::Error,
            },
        }
    }

    /// Whether the retry loop may attempt this operation again.
    ///
    /// Unknown errors count as recoverable; the forwarder grants them exactly
    /// one retry before reclassifying as fatal for the group.
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Unknown => true,
            ErrorCategory::Auth | ErrorCategory::Permission => false,
            ErrorCategory::DataIntegrity => matches!(self, Error::Database(_)),
            ErrorCategory::System => matches!(self, Error::DatabaseBusy { .. }),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_is_recoverable_rate_limit() {
        let err = Error::RateLimited { seconds: 5 };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert!(err.is_recoverable());
        assert_eq!(err.severity(), Severity::Warning);
    }

    #[test]
    fn test_auth_is_critical_and_fatal() {
        let err = Error::AuthRequired("relay_1".into());
        assert_eq!(err.category(), ErrorCategory::Auth);
        assert!(!err.is_recoverable());
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn test_permission_is_fatal() {
        let err = Error::Permission("banned in channel".into());
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Permission);
    }

    #[test]
    fn test_unknown_defaults_to_recoverable() {
        let err = Error::Internal("odd rpc result".into());
        assert_eq!(err.category(), ErrorCategory::Unknown);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_cancelled_is_info() {
        assert_eq!(Error::Cancelled.severity(), Severity::Info);
        assert!(!Error::Cancelled.is_recoverable());
    }
}
