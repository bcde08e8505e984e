//! Attribution headers for forwarded messages.

use crate::config::AttributionConfig;
use crate::db::Archive;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Origin details rendered into an attribution header.
#[derive(Debug, Clone)]
pub struct AttributionContext {
    pub sender_name: String,
    pub sender_id: i64,
    pub source_channel_name: String,
    pub source_channel_id: i64,
    pub message_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// Template-driven attribution formatter with a persistent per-source
/// counter.
pub struct Attribution {
    config: AttributionConfig,
    archive: Arc<Archive>,
}

impl Attribution {
    pub fn new(config: AttributionConfig, archive: Arc<Archive>) -> Self {
        Attribution { config, archive }
    }

    /// Render the origin header for a message bound for `destination_id`.
    /// Returns an empty string for destinations with attribution disabled.
    /// Each rendered header bumps the source channel's counter.
    pub fn format(&self, ctx: &AttributionContext, destination_id: i64) -> String {
        if self
            .config
            .disable_attribution_for_groups
            .contains(&destination_id)
        {
            return String::new();
        }

        let timestamp = ctx
            .timestamp
            .format(&self.config.timestamp_format)
            .to_string();
        let header = self
            .config
            .template
            .replace("{sender_name}", &ctx.sender_name)
            .replace("{sender_id}", &ctx.sender_id.to_string())
            .replace("{source_channel_name}", &ctx.source_channel_name)
            .replace("{source_channel_id}", &ctx.source_channel_id.to_string())
            .replace("{message_id}", &ctx.message_id.to_string())
            .replace("{timestamp}", &timestamp);

        if let Err(e) = self.archive.update_attribution_stats(ctx.source_channel_id) {
            warn!("failed to update attribution stats: {}", e);
        }
        header
    }
}

/// Prepend a header to a message body with a blank line in between.
/// Either part may be empty.
pub fn with_header(header: &str, body: &str) -> String {
    match (header.is_empty(), body.is_empty()) {
        (true, _) => body.to_string(),
        (false, true) => header.to_string(),
        (false, false) => format!("{}\n\n{}", header, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::TimeZone;

    fn context() -> AttributionContext {
        AttributionContext {
            sender_name: "watcher".into(),
            sender_id: 101,
            source_channel_name: "intel feed".into(),
            source_channel_id: 789,
            message_id: 456,
            timestamp: chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn attribution(config: AttributionConfig) -> (tempfile::TempDir, Arc<Archive>, Attribution) {
        let (dir, archive) = db::test_archive();
        let archive = Arc::new(archive);
        (dir, archive.clone(), Attribution::new(config, archive))
    }

    #[test]
    fn test_template_fields() {
        let (_dir, _archive, attribution) = attribution(AttributionConfig {
            template: "{sender_name}/{sender_id} from {source_channel_name} ({source_channel_id}) msg {message_id} at {timestamp}".into(),
            timestamp_format: "%Y-%m-%d".into(),
            disable_attribution_for_groups: vec![],
        });
        assert_eq!(
            attribution.format(&context(), 1),
            "watcher/101 from intel feed (789) msg 456 at 2025-01-01"
        );
    }

    #[test]
    fn test_disabled_destination_gets_empty_header() {
        let (_dir, archive, attribution) = attribution(AttributionConfig {
            template: "{sender_name}".into(),
            timestamp_format: "%Y-%m-%d".into(),
            disable_attribution_for_groups: vec![123],
        });
        assert_eq!(attribution.format(&context(), 123), "");
        // Suppressed headers do not count as attributions.
        assert_eq!(archive.attribution_count(789).unwrap(), 0);
    }

    #[test]
    fn test_stats_counter_increments() {
        let (_dir, archive, attribution) = attribution(AttributionConfig::default());
        attribution.format(&context(), 1);
        attribution.format(&context(), 1);
        assert_eq!(archive.attribution_count(789).unwrap(), 2);
    }

    #[test]
    fn test_with_header_joins_with_blank_line() {
        assert_eq!(with_header("[hdr]", "body"), "[hdr]\n\nbody");
        assert_eq!(with_header("", "body"), "body");
        assert_eq!(with_header("[hdr]", ""), "[hdr]");
    }
}
