//! Schedule-driven file queueing and the persistent queue drain.

use super::Forwarder;
use crate::db::{QueueItem, QueueStatus};
use crate::dedup::LocalFile;
use crate::error::{Error, ErrorCategory, Result};
use crate::recovery::retry_with_backoff;
use crate::scratch::ScratchDir;
use crate::telegram::ResolvedEntity;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome counters for one queue drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDrainReport {
    pub forwarded: u64,
    pub failed: u64,
    pub bytes_forwarded: u64,
}

impl Forwarder {
    /// Scan a schedule's source for files passing its filters and enqueue
    /// the non-duplicates. Returns the number of rows added.
    pub async fn forward_files_by_schedule(
        &self,
        schedule_id: i64,
        account: Option<&str>,
    ) -> Result<u64> {
        let schedule = self.archive().file_forward_schedule_by_id(schedule_id)?;
        let source = self.pool().resolve_entity(account, &schedule.source).await?;

        let messages = self
            .pool()
            .iter_history(account, &source, schedule.last_message_id as i32, true)
            .await?;

        let mut queued = 0u64;
        for message in &messages {
            let Some(file_id) = message.file_id.clone() else {
                continue;
            };
            if !schedule.accepts(message.mime.as_deref(), message.file_size) {
                continue;
            }

            if self.config().forwarding.enable_deduplication {
                let scratch = ScratchDir::create(Path::new(&self.config().media_dir))?;
                let local = match self.pool().download_media(account, message, &scratch).await {
                    Ok(path) => Some(LocalFile {
                        file_id: file_id.clone(),
                        message_id: i64::from(message.id),
                        topic_id: message.topic_id,
                        path,
                        mime: message.mime.clone(),
                    }),
                    Err(e) => {
                        warn!(
                            "download for queue dedup failed (msg {}): {}",
                            message.id,
                            self.redactor().redact(&e.to_string())
                        );
                        None
                    }
                };
                if let Some(local) = local {
                    let scope = self.dedup().scope_for(source.id);
                    if self.dedup().check_group(&[local], scope)?.duplicate {
                        continue;
                    }
                }
            }

            self.archive().add_to_file_forward_queue(
                Some(schedule_id),
                i64::from(message.id),
                &file_id,
                None,
            )?;
            queued += 1;
        }

        info!(
            "schedule {}: queued {} of {} candidate file(s)",
            schedule_id,
            queued,
            messages.len()
        );
        Ok(queued)
    }

    /// Drain pending queue rows in priority-then-id order. Each row settles
    /// to `success` or `error:<reason>` exactly once; rows in flight when
    /// the task is cancelled simply stay pending. Schedule watermarks move
    /// only after the corresponding forward succeeded and was recorded.
    pub async fn process_file_forward_queue(&self, account: Option<&str>) -> Result<QueueDrainReport> {
        let pending = self.archive().pending_file_forward_queue()?;
        if pending.is_empty() {
            return Ok(QueueDrainReport::default());
        }
        info!("draining {} pending queue row(s)", pending.len());

        let mut report = QueueDrainReport::default();
        let mut watermarks: HashMap<i64, i64> = HashMap::new();

        for item in pending {
            match self.drain_one(&item, account).await {
                Ok(bytes) => {
                    self.archive()
                        .update_file_forward_queue_status(item.id, &QueueStatus::Success)?;
                    report.forwarded += 1;
                    report.bytes_forwarded += bytes;
                    if let Some(schedule_id) = item.schedule_id {
                        let mark = watermarks.entry(schedule_id).or_insert(0);
                        *mark = (*mark).max(item.message_id);
                    }
                }
                Err(e) if e.category() == ErrorCategory::Auth => {
                    // The whole drain runs on this session; give up now and
                    // leave the remaining rows pending.
                    return Err(e);
                }
                Err(e) => {
                    let reason = self.redactor().short_error(&e);
                    self.archive()
                        .update_file_forward_queue_status(item.id, &QueueStatus::Error(reason))?;
                    report.failed += 1;
                }
            }
        }

        for (schedule_id, last_id) in watermarks {
            self.archive()
                .update_file_forward_watermark(schedule_id, last_id)?;
        }

        info!(
            "queue drain complete: {} forwarded, {} failed",
            report.forwarded, report.failed
        );
        Ok(report)
    }

    /// Forward one queue row and record its file. Returns bytes forwarded.
    async fn drain_one(&self, item: &QueueItem, account: Option<&str>) -> Result<u64> {
        let schedule = match item.schedule_id {
            Some(id) => Some(self.archive().file_forward_schedule_by_id(id).map_err(|_| {
                Error::ScheduleNotFound(id)
            })?),
            None => None,
        };

        let destination_ref = item
            .destination
            .clone()
            .or_else(|| schedule.as_ref().map(|s| s.destination.clone()))
            .ok_or_else(|| Error::InvalidConfig("queue row has no destination".to_string()))?;
        let source_ref = schedule
            .as_ref()
            .map(|s| s.source.clone())
            .ok_or_else(|| Error::ScheduleNotFound(item.schedule_id.unwrap_or(0)))?;

        let source = self.pool().resolve_entity(account, &source_ref).await?;
        let destination = self.pool().resolve_entity(account, &destination_ref).await?;

        let message_id = item.message_id as i32;
        let source_ref = &source;
        let destination_ref = &destination;
        retry_with_backoff(self.policy(), "queue forward", || async move {
            self.pool()
                .forward_messages(account, source_ref, &[message_id], destination_ref)
                .await
        })
        .await?;

        let bytes = self
            .record_queued_file(item, account, &source)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    "recording queued file failed (row {}): {}",
                    item.id,
                    self.redactor().redact(&e.to_string())
                );
                0
            });

        self.throttle(bytes).await;
        Ok(bytes)
    }

    /// Download the forwarded file once more to persist its hashes and
    /// inventory row. Returns the file size for throttling.
    async fn record_queued_file(
        &self,
        item: &QueueItem,
        account: Option<&str>,
        source: &ResolvedEntity,
    ) -> Result<u64> {
        let Some(message) = self
            .pool()
            .get_message(account, source, item.message_id as i32)
            .await?
        else {
            return Ok(0);
        };
        let Some(file_id) = message.file_id.clone() else {
            return Ok(0);
        };

        let scratch = ScratchDir::create(Path::new(&self.config().media_dir))?;
        let path = self.pool().download_media(account, &message, &scratch).await?;
        let local = LocalFile {
            file_id,
            message_id: item.message_id,
            topic_id: message.topic_id,
            path,
            mime: message.mime.clone(),
        };
        let scope = self.dedup().scope_for(source.id);
        let verdict = self.dedup().check_group(&[local], scope)?;
        self.dedup().record(&verdict, source.id)?;
        Ok(message.file_size.max(0) as u64)
    }

    /// Sleep proportionally to the bytes just moved so the aggregate
    /// transfer rate converges under the configured cap.
    async fn throttle(&self, bytes: u64) {
        let limit_kbps = self.config().scheduler.bandwidth_limit_kbps;
        if limit_kbps == 0 || bytes == 0 {
            return;
        }
        let seconds = bytes as f64 / (limit_kbps as f64 * 1024.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_report_default_is_zero() {
        let report = QueueDrainReport::default();
        assert_eq!(report.forwarded, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes_forwarded, 0);
    }
}
