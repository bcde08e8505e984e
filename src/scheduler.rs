//! Cron-driven schedule engine.
//!
//! Polls the schedule tables on a jittered interval, fires due schedules
//! into the file-forward pipeline, and drains the persistent queue. Fires
//! for a schedule already in flight are coalesced; total concurrency is
//! bounded by `max_concurrent_forwards`.

use crate::config::Config;
use crate::db::Archive;
use crate::error::Result;
use crate::forwarding::Forwarder;

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Jitter fraction applied to the poll interval
const POLL_JITTER: f64 = 0.2;

/// Evaluates cron schedules and dispatches forwarding work.
pub struct Scheduler {
    config: Arc<Config>,
    archive: Arc<Archive>,
    forwarder: Arc<Forwarder>,
    /// Per-schedule advisory locks; a schedule id present here is running.
    running: Arc<parking_lot::Mutex<HashSet<i64>>>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, archive: Arc<Archive>, forwarder: Arc<Forwarder>) -> Self {
        let permits = Arc::new(Semaphore::new(config.scheduler.max_concurrent_forwards));
        Scheduler {
            config,
            archive,
            forwarder,
            running: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            permits,
        }
    }

    /// Run the scheduler loop until the surrounding task is cancelled.
    ///
    /// Pending queue rows left over from an earlier run are drained before
    /// any cron trigger is accepted.
    pub async fn run(&self) -> Result<()> {
        match self.forwarder.process_file_forward_queue(None).await {
            Ok(report) if report.forwarded + report.failed > 0 => {
                info!(
                    "startup drain: {} forwarded, {} failed",
                    report.forwarded, report.failed
                );
            }
            Ok(_) => {}
            Err(e) => warn!("startup queue drain failed: {}", e),
        }

        let base = Duration::from_secs(self.config.scheduler.poll_interval_seconds.max(1));
        let mut last_tick = Utc::now();

        loop {
            tokio::time::sleep(jittered_interval(base)).await;
            let now = Utc::now();
            if let Err(e) = self.tick(last_tick, now).await {
                warn!("scheduler tick failed: {}", e);
            }
            last_tick = now;
        }
    }

    /// Fire every enabled schedule whose cron expression matched since the
    /// last tick.
    async fn tick(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        for schedule in self.archive.file_forward_schedules()? {
            if !cron_fires_between(&schedule.schedule, since, now) {
                continue;
            }
            if !self.try_claim(schedule.id) {
                info!("schedule {} still running, coalescing fire", schedule.id);
                continue;
            }

            let forwarder = self.forwarder.clone();
            let running = self.running.clone();
            let permits = self.permits.clone();
            let schedule_id = schedule.id;

            tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        running.lock().remove(&schedule_id);
                        return;
                    }
                };
                info!("schedule {} fired", schedule_id);

                if let Err(e) = forwarder.forward_files_by_schedule(schedule_id, None).await {
                    warn!("schedule {} enqueue failed: {}", schedule_id, e);
                }
                if let Err(e) = forwarder.process_file_forward_queue(None).await {
                    warn!("schedule {} drain failed: {}", schedule_id, e);
                }

                running.lock().remove(&schedule_id);
            });
        }
        Ok(())
    }

    fn try_claim(&self, schedule_id: i64) -> bool {
        self.running.lock().insert(schedule_id)
    }
}

/// Poll interval with ±20 % jitter so fleet members never tick in lockstep.
fn jittered_interval(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(-POLL_JITTER..=POLL_JITTER);
    Duration::from_secs_f64((base.as_secs_f64() * (1.0 + jitter)).max(1.0))
}

/// Whether a cron expression has a firing instant in `(since, now]`.
/// Five-field expressions are accepted by assuming second zero.
pub(crate) fn cron_fires_between(expr: &str, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    let schedule = match cron::Schedule::from_str(&normalized) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!("invalid cron expression '{}': {}", expr, e);
            return false;
        }
    };
    schedule
        .after(&since)
        .next()
        .map(|next| next <= now)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_fires_across_minute_boundary() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 30).unwrap();
        assert!(cron_fires_between("0 * * * * *", since, now));
    }

    #[test]
    fn test_cron_does_not_fire_within_minute() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 10).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 40).unwrap();
        assert!(!cron_fires_between("0 * * * * *", since, now));
    }

    #[test]
    fn test_five_field_expression_normalized() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 9, 59, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 5).unwrap();
        assert!(cron_fires_between("* * * * *", since, now));
    }

    #[test]
    fn test_hourly_expression_only_fires_on_the_hour() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2025, 6, 1, 9, 59, 0).unwrap();
        assert!(cron_fires_between("0 0 * * * *", since, boundary));
        assert!(!cron_fires_between("0 0 * * * *", since, before));
    }

    #[test]
    fn test_invalid_expression_never_fires() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        assert!(!cron_fires_between("not a cron line", since, now));
    }

    #[test]
    fn test_jittered_interval_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..32 {
            let secs = jittered_interval(base).as_secs_f64();
            assert!((48.0..=72.0).contains(&secs), "{}", secs);
        }
    }
}
