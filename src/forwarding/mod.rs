//! Forwarder state machine
//!
//! Orchestrates grouping, deduplication, forwarding, and recording for a
//! (source, destination, account) triple. A group either forwards fully and
//! is recorded, or leaves no dedup side effects; secondary destinations and
//! saved-messages fan-out are best-effort once the primary forward stands.

mod queue;

pub use queue::QueueDrainReport;

use crate::attribution::{Attribution, AttributionContext};
use crate::config::Config;
use crate::db::{Archive, ForwardStats};
use crate::dedup::{DedupOracle, GroupVerdict, LocalFile};
use crate::error::{Error, ErrorCategory, Result};
use crate::grouping::group_messages;
use crate::recovery::{retry_with_backoff, Redactor, RetryPolicy};
use crate::scratch::ScratchDir;
use crate::telegram::{ClientPool, FetchedMessage, ResolvedEntity};

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Checkpoint context used for resumable channel scans
const SYNC_CONTEXT: &str = "sync";

/// Groups processed between checkpoint writes during long scans
const CHECKPOINT_EVERY: usize = 50;

/// Per-run options for a forwarding operation.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Account identifier (session name or phone); pool picks otherwise
    pub account: Option<String>,
    /// Resume point; falls back to the stored checkpoint, then 0
    pub start_message_id: Option<i32>,
}

/// Result of one group passing through the state machine.
enum GroupOutcome {
    Forwarded { files: u64, bytes: u64, messages: u64 },
    Duplicate,
    Failed,
}

/// Outcome of one channel in total-forward mode.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    pub channel_id: i64,
    pub account: String,
    pub stats: ForwardStats,
    pub error: Option<String>,
}

/// Aggregated total-forward report with outcomes split by class.
#[derive(Debug, Clone, Default)]
pub struct ChannelReport {
    pub successful: Vec<ChannelOutcome>,
    pub banned: Vec<ChannelOutcome>,
    pub failed: Vec<ChannelOutcome>,
}

impl ChannelReport {
    pub fn totals(&self) -> ForwardStats {
        let mut total = ForwardStats::default();
        for outcome in &self.successful {
            total.merge(&outcome.stats);
        }
        total
    }
}

/// Moves message groups from origins to destinations with dedup, attribution,
/// and recording.
pub struct Forwarder {
    config: Arc<Config>,
    archive: Arc<Archive>,
    pool: Arc<ClientPool>,
    dedup: DedupOracle,
    attribution: Attribution,
    policy: RetryPolicy,
    redactor: Redactor,
}

impl Forwarder {
    pub fn new(config: Arc<Config>, archive: Arc<Archive>, pool: Arc<ClientPool>) -> Result<Self> {
        let dedup = DedupOracle::new(archive.clone(), config.deduplication.clone())?;
        let attribution = Attribution::new(config.attribution.clone(), archive.clone());
        let policy = RetryPolicy::new(&config.retry);
        Ok(Forwarder {
            config,
            archive,
            pool,
            dedup,
            attribution,
            policy,
            redactor: Redactor::new(),
        })
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// The client pool this forwarder rents sessions from.
    pub fn client_pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Forward everything new from `origin` to `destination`.
    ///
    /// Returns the id of the last fully processed group representative and
    /// the per-run counters.
    pub async fn forward_messages(
        &self,
        origin: &str,
        destination: &str,
        options: &ForwardOptions,
    ) -> Result<(Option<i64>, ForwardStats)> {
        let account = options.account.as_deref();
        let origin_entity = self.pool.resolve_entity(account, origin).await?;
        let destination_entity = self.pool.resolve_entity(account, destination).await?;

        let checkpoint_key = origin_entity.id.to_string();
        let min_id = match options.start_message_id {
            Some(id) => id,
            None => self
                .archive
                .latest_checkpoint(&checkpoint_key, SYNC_CONTEXT)?
                .map(|id| id as i32)
                .unwrap_or(0),
        };

        let messages = self
            .pool
            .iter_history(account, &origin_entity, min_id, true)
            .await?;
        info!(
            "fetched {} media message(s) from {} (min_id {})",
            messages.len(),
            origin_entity.title,
            min_id
        );

        let groups = group_messages(
            messages,
            self.config.grouping.strategy,
            self.config.grouping.time_window_seconds,
        );
        info!("processing {} message group(s)", groups.len());

        let mut stats = ForwardStats::default();
        let mut new_last_id: Option<i64> = None;
        let mut since_checkpoint = 0usize;

        for group in &groups {
            let representative = match group.first() {
                Some(first) => i64::from(first.id),
                None => continue,
            };

            match self
                .process_group(account, &origin_entity, &destination_entity, group)
                .await
            {
                Ok(GroupOutcome::Forwarded { files, bytes, messages }) => {
                    stats.messages_forwarded += messages;
                    stats.files_forwarded += files;
                    stats.bytes_forwarded += bytes;
                    new_last_id = Some(representative);
                    since_checkpoint += 1;
                }
                Ok(GroupOutcome::Duplicate) => {
                    info!(
                        "group (representative {}) contains a duplicate, skipping",
                        representative
                    );
                }
                Ok(GroupOutcome::Failed) => {
                    warn!("group (representative {}) failed, advancing", representative);
                }
                Err(e) if e.category() == ErrorCategory::Auth => {
                    error!("auth failure, aborting run: {}", self.redactor.redact(&e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "group (representative {}) error: {}",
                        representative,
                        self.redactor.redact(&e.to_string())
                    );
                }
            }

            if since_checkpoint >= CHECKPOINT_EVERY {
                if let Some(last) = new_last_id {
                    self.archive
                        .save_checkpoint(&checkpoint_key, SYNC_CONTEXT, last)?;
                }
                since_checkpoint = 0;
            }
        }

        if let Some(last) = new_last_id {
            self.archive
                .save_checkpoint(&checkpoint_key, SYNC_CONTEXT, last)?;
        }
        Ok((new_last_id, stats))
    }

    /// Per-group pipeline: dedupe, forward each message, record, then
    /// best-effort secondary and saved-messages legs.
    async fn process_group(
        &self,
        account: Option<&str>,
        origin: &ResolvedEntity,
        destination: &ResolvedEntity,
        group: &[FetchedMessage],
    ) -> Result<GroupOutcome> {
        if group.is_empty() {
            return Ok(GroupOutcome::Failed);
        }

        let verdict = if self.config.forwarding.enable_deduplication {
            let verdict = self.check_group_duplicates(account, origin, group).await?;
            if verdict.duplicate {
                return Ok(GroupOutcome::Duplicate);
            }
            Some(verdict)
        } else {
            None
        };

        let mut forwarded: u64 = 0;
        let mut files: u64 = 0;
        let mut bytes: u64 = 0;

        for (idx, message) in group.iter().enumerate() {
            match self
                .forward_one(account, origin, destination, message)
                .await
            {
                Ok(()) => {
                    forwarded += 1;
                    if message.has_file() {
                        files += 1;
                        bytes += message.file_size.max(0) as u64;
                    }
                }
                Err(Error::RateLimited { seconds }) => {
                    // Backoff already honored by the retry loop; skip the
                    // rest of the group so nothing is forwarded twice.
                    warn!(
                        "flood wait ({}s) persists, skipping remainder of group",
                        seconds
                    );
                    return Ok(GroupOutcome::Failed);
                }
                Err(e) if e.category() == ErrorCategory::Auth => return Err(e),
                Err(e) if e.category() == ErrorCategory::Permission => {
                    warn!("permission error, stopping group: {}", e);
                    return Ok(GroupOutcome::Failed);
                }
                Err(e) => {
                    warn!(
                        "forward failed for message {}: {}",
                        message.id,
                        self.redactor.redact(&e.to_string())
                    );
                    return Ok(GroupOutcome::Failed);
                }
            }

            if group.len() > 1 && idx + 1 < group.len() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        // Primary forward stands: record fingerprints, then best-effort legs.
        if let Some(verdict) = &verdict {
            if let Err(e) = self.dedup.record(verdict, origin.id) {
                error!("failed to record forwarded group: {}", e);
            }
        }

        let ids: Vec<i32> = group.iter().map(|m| m.id).collect();
        self.forward_to_secondary(account, origin, &ids).await;
        if self.config.forwarding.forward_to_all_saved_messages {
            if let Err(e) = self.pool.forward_to_saved_messages(origin, &ids).await {
                warn!("saved-messages fan-out failed: {}", e);
            }
        }

        Ok(GroupOutcome::Forwarded {
            files,
            bytes,
            messages: forwarded,
        })
    }

    /// Forward one message, with attribution and the restricted-source
    /// fallback, under the retry policy.
    async fn forward_one(
        &self,
        account: Option<&str>,
        origin: &ResolvedEntity,
        destination: &ResolvedEntity,
        message: &FetchedMessage,
    ) -> Result<()> {
        let topic = self.config.forwarding.destination_topic_id;
        let with_attribution =
            self.config.forwarding.forward_with_attribution && topic.is_none();

        if with_attribution {
            // Attribution needs a fresh message carrying the header, so the
            // repost path is used directly.
            let header = self.attribution_header(origin, destination, message);
            return retry_with_backoff(&self.policy, "repost", || {
                let header = header.clone();
                async move {
                    self.pool
                        .repost_via_download(account, message, destination, &header, topic)
                        .await
                }
            })
            .await;
        }

        let direct = retry_with_backoff(&self.policy, "forward", || async move {
            self.pool
                .forward_messages(account, origin, &[message.id], destination)
                .await
        })
        .await;

        match direct {
            Ok(_) => Ok(()),
            Err(Error::ForwardRestricted(_)) => {
                warn!(
                    "forwarding restricted on source (msg {}), using repost workaround",
                    message.id
                );
                let header = if self.config.forwarding.forward_with_attribution {
                    self.attribution_header(origin, destination, message)
                } else {
                    String::new()
                };
                retry_with_backoff(&self.policy, "repost", || {
                    let header = header.clone();
                    async move {
                        self.pool
                            .repost_via_download(account, message, destination, &header, topic)
                            .await
                    }
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    fn attribution_header(
        &self,
        origin: &ResolvedEntity,
        destination: &ResolvedEntity,
        message: &FetchedMessage,
    ) -> String {
        let ctx = AttributionContext {
            sender_name: message.sender_name.clone().unwrap_or_default(),
            sender_id: message.sender_id.unwrap_or_default(),
            source_channel_name: origin.title.clone(),
            source_channel_id: origin.id,
            message_id: i64::from(message.id),
            timestamp: Utc
                .timestamp_opt(message.timestamp, 0)
                .single()
                .unwrap_or_else(Utc::now),
        };
        self.attribution.format(&ctx, destination.id)
    }

    /// Download the group's files into scratch and ask the oracle.
    async fn check_group_duplicates(
        &self,
        account: Option<&str>,
        origin: &ResolvedEntity,
        group: &[FetchedMessage],
    ) -> Result<GroupVerdict> {
        let scratch = ScratchDir::create(Path::new(&self.config.media_dir))?;
        let mut local_files = Vec::new();

        for message in group {
            let Some(file_id) = message.file_id.clone() else {
                continue;
            };
            match self.pool.download_media(account, message, &scratch).await {
                Ok(path) => local_files.push(LocalFile {
                    file_id,
                    message_id: i64::from(message.id),
                    topic_id: message.topic_id,
                    path,
                    mime: message.mime.clone(),
                }),
                Err(e) => {
                    // Failed downloads pass through as non-duplicates and
                    // leave no fingerprint behind.
                    warn!(
                        "download for dedup failed (msg {}): {}",
                        message.id,
                        self.redactor.redact(&e.to_string())
                    );
                }
            }
        }

        let scope = self.dedup.scope_for(origin.id);
        self.dedup.check_group(&local_files, scope)
    }

    /// Best-effort forward of a non-duplicate group to the secondary unique
    /// destination.
    async fn forward_to_secondary(
        &self,
        account: Option<&str>,
        origin: &ResolvedEntity,
        ids: &[i32],
    ) {
        let Some(secondary) = self.config.forwarding.secondary_unique_destination.clone() else {
            return;
        };
        let result: Result<()> = async {
            let secondary_entity = self.pool.resolve_entity(account, &secondary).await?;
            self.pool
                .forward_messages(account, origin, ids, &secondary_entity)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(
                "secondary destination '{}' forward failed: {}",
                secondary,
                self.redactor.redact(&e.to_string())
            );
        }
    }

    /// Total-forward mode: walk every channel any account can see and move
    /// its content to `destination`. Exactly one account is tried per
    /// channel per pass; failures are isolated per channel.
    pub async fn forward_all_accessible_channels(&self, destination: &str) -> Result<ChannelReport> {
        let channels = self.archive.get_all_unique_channels()?;
        if channels.is_empty() {
            warn!("no channels recorded in account_channel_access");
            return Ok(ChannelReport::default());
        }
        info!("total-forward over {} unique channel(s)", channels.len());

        let mut report = ChannelReport::default();
        for (idx, access) in channels.iter().enumerate() {
            info!(
                "[{}/{}] channel {} via {}",
                idx + 1,
                channels.len(),
                access.channel_id,
                access.account_phone
            );
            let options = ForwardOptions {
                account: Some(access.account_phone.clone()),
                start_message_id: None,
            };
            let outcome = self
                .forward_messages(&access.channel_id.to_string(), destination, &options)
                .await;

            match outcome {
                Ok((_, stats)) => report.successful.push(ChannelOutcome {
                    channel_id: access.channel_id,
                    account: access.account_phone.clone(),
                    stats,
                    error: None,
                }),
                Err(e) => {
                    let redacted = self.redactor.redact(&e.to_string());
                    let outcome = ChannelOutcome {
                        channel_id: access.channel_id,
                        account: access.account_phone.clone(),
                        stats: ForwardStats::default(),
                        error: Some(redacted),
                    };
                    if matches!(&e, Error::Permission(name) if name.contains("USER_BANNED")) {
                        report.banned.push(outcome);
                    } else {
                        report.failed.push(outcome);
                    }
                    self.pool.disconnect().await;
                }
            }
        }

        log_report(&report);
        Ok(report)
    }

    /// Strip forwarding headers inside a channel by re-posting each message
    /// and deleting the original. Stops as soon as deletion is refused.
    pub async fn repost_messages_in_channel(
        &self,
        channel: &str,
        account: Option<&str>,
    ) -> Result<u64> {
        let entity = self.pool.resolve_entity(account, channel).await?;
        let messages = self.pool.iter_history(account, &entity, 0, false).await?;

        let mut reposted = 0u64;
        for message in &messages {
            if message.text.is_empty() && !message.has_media() {
                continue;
            }
            self.pool
                .repost_via_download(account, message, &entity, "", None)
                .await?;
            match self
                .pool
                .delete_messages(account, &entity, &[message.id])
                .await
            {
                Ok(_) => reposted += 1,
                Err(e) if e.category() == ErrorCategory::Permission => {
                    error!("cannot delete message {}, stopping: {}", message.id, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reposted)
    }

    /// Inventory pass over a channel: hash every file and record it without
    /// forwarding anything. Returns how many new files were recorded.
    pub async fn scan_channel(&self, channel: &str, account: Option<&str>) -> Result<u64> {
        let entity = self.pool.resolve_entity(account, channel).await?;
        let messages = self.pool.iter_history(account, &entity, 0, true).await?;

        let mut recorded = 0u64;
        for message in &messages {
            let Some(file_id) = message.file_id.clone() else {
                continue;
            };
            let scratch = ScratchDir::create(Path::new(&self.config.media_dir))?;
            let path = match self.pool.download_media(account, message, &scratch).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(
                        "scan download failed (msg {}): {}",
                        message.id,
                        self.redactor.redact(&e.to_string())
                    );
                    continue;
                }
            };
            let local = LocalFile {
                file_id,
                message_id: i64::from(message.id),
                topic_id: message.topic_id,
                path,
                mime: message.mime.clone(),
            };
            let verdict = self.dedup.check_group(&[local], self.dedup.scope_for(entity.id))?;
            if !verdict.duplicate && !verdict.digests.is_empty() {
                self.dedup.record(&verdict, entity.id)?;
                recorded += 1;
            }
        }
        info!("scan of {} recorded {} new file(s)", entity.title, recorded);
        Ok(recorded)
    }

    pub(crate) fn dedup(&self) -> &DedupOracle {
        &self.dedup
    }

    pub(crate) fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Log the total-forward summary, truncating each class to ten entries.
fn log_report(report: &ChannelReport) {
    info!(
        "total-forward summary: {} successful, {} banned, {} failed",
        report.successful.len(),
        report.banned.len(),
        report.failed.len()
    );
    let totals = report.totals();
    info!(
        "recovered {} message(s), {} file(s) ({} bytes)",
        totals.messages_forwarded, totals.files_forwarded, totals.bytes_forwarded
    );
    for outcome in report.banned.iter().take(10) {
        warn!(
            "banned: channel {} (account {})",
            outcome.channel_id, outcome.account
        );
    }
    if report.banned.len() > 10 {
        warn!("... and {} more banned channels", report.banned.len() - 10);
    }
    for outcome in report.failed.iter().take(10) {
        warn!(
            "failed: channel {}: {}",
            outcome.channel_id,
            outcome.error.as_deref().unwrap_or("unknown")
        );
    }
    if report.failed.len() > 10 {
        warn!("... and {} more failed channels", report.failed.len() - 10);
    }
}
