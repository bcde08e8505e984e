//! Upstream verb pacing.
//!
//! Telegram tolerates short bursts but answers sustained pressure with
//! flood waits. The pacer spaces verbs out at a jittered base interval and
//! reacts to upstream feedback: every observed flood wait doubles the
//! spacing, every clean verb walks it back down. Jitter comes from the
//! same retry configuration the backoff policy uses, so no two deployments
//! pace in lockstep.

use crate::config::RetryConfig;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Hard ceiling on the spacing between verbs, penalties included
const MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Penalty doublings applied at most; 2^6 over the base interval
const MAX_PENALTY: u32 = 6;

/// Flood-aware spacing for upstream verbs.
pub struct UpstreamPacer {
    /// Bounds verbs in flight at once
    slots: Semaphore,
    /// Spacing between verbs under no flood pressure
    base_interval: Duration,
    /// Current escalation level; each step doubles the spacing
    penalty: AtomicU32,
    /// Symmetric jitter fraction applied to every spacing decision
    jitter_factor: f64,
    /// When the previous verb was admitted
    last_admitted: parking_lot::Mutex<Instant>,
}

impl UpstreamPacer {
    /// Build a pacer allowing `max_in_flight` concurrent verbs at
    /// `verbs_per_second`, with jitter taken from the retry policy.
    pub fn new(max_in_flight: usize, verbs_per_second: f64, retry: &RetryConfig) -> Self {
        let base_interval = if verbs_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / verbs_per_second)
        } else {
            Duration::ZERO
        };
        UpstreamPacer {
            slots: Semaphore::new(max_in_flight),
            base_interval,
            penalty: AtomicU32::new(0),
            jitter_factor: retry.jitter_factor.clamp(0.0, 1.0),
            last_admitted: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// A pacer that admits immediately (for tests).
    pub fn unlimited() -> Self {
        UpstreamPacer {
            slots: Semaphore::new(100),
            base_interval: Duration::ZERO,
            penalty: AtomicU32::new(0),
            jitter_factor: 0.0,
            last_admitted: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Wait until the next verb may go out. The returned permit bounds
    /// concurrency for the verb's duration.
    pub async fn admit(&self) -> PacerPermit<'_> {
        let permit = self.slots.acquire().await.expect("pacer semaphore closed");

        let interval = self.current_interval();
        if !interval.is_zero() {
            let mut last = self.last_admitted.lock();
            let elapsed = last.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                drop(last); // not held while sleeping
                sleep(wait).await;
                last = self.last_admitted.lock();
            }
            *last = Instant::now();
        }

        PacerPermit { _permit: permit }
    }

    /// Upstream announced a flood wait: double the spacing.
    pub fn note_flood_wait(&self) {
        let _ = self
            .penalty
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                (p < MAX_PENALTY).then_some(p + 1)
            });
    }

    /// A verb completed cleanly: walk the spacing back down one step.
    pub fn note_success(&self) {
        let _ = self
            .penalty
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                (p > 0).then_some(p - 1)
            });
    }

    /// Spacing to apply right now: the base interval doubled per penalty
    /// step, capped, with symmetric jitter.
    fn current_interval(&self) -> Duration {
        if self.base_interval.is_zero() {
            return Duration::ZERO;
        }
        let penalty = self.penalty.load(Ordering::Relaxed);
        let scaled = self
            .base_interval
            .saturating_mul(1u32 << penalty.min(MAX_PENALTY))
            .min(MAX_INTERVAL);
        if self.jitter_factor <= 0.0 {
            return scaled;
        }
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        Duration::from_secs_f64((scaled.as_secs_f64() * (1.0 + jitter)).max(0.0))
    }

    #[cfg(test)]
    fn penalty_level(&self) -> u32 {
        self.penalty.load(Ordering::Relaxed)
    }
}

/// Concurrency slot held for one verb
pub struct PacerPermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(verbs_per_second: f64) -> UpstreamPacer {
        UpstreamPacer::new(2, verbs_per_second, &RetryConfig::default())
    }

    #[tokio::test]
    async fn test_pacer_bounds_concurrency() {
        let pacer = UpstreamPacer::unlimited();
        let _a = pacer.admit().await;
        let _b = pacer.admit().await;
    }

    #[tokio::test]
    async fn test_unlimited_admits_without_spacing() {
        let pacer = UpstreamPacer::unlimited();
        let start = Instant::now();
        for _ in 0..10 {
            let _permit = pacer.admit().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_flood_waits_escalate_and_successes_decay() {
        let pacer = pacer(5.0);
        assert_eq!(pacer.penalty_level(), 0);

        pacer.note_flood_wait();
        pacer.note_flood_wait();
        assert_eq!(pacer.penalty_level(), 2);

        pacer.note_success();
        assert_eq!(pacer.penalty_level(), 1);

        pacer.note_success();
        pacer.note_success();
        assert_eq!(pacer.penalty_level(), 0, "decay saturates at zero");
    }

    #[test]
    fn test_penalty_saturates_at_cap() {
        let pacer = pacer(5.0);
        for _ in 0..20 {
            pacer.note_flood_wait();
        }
        assert_eq!(pacer.penalty_level(), MAX_PENALTY);
    }

    #[test]
    fn test_interval_doubles_per_penalty_within_jitter() {
        let pacer = pacer(5.0); // 200ms base
        let base = 0.2;
        for _ in 0..16 {
            let secs = pacer.current_interval().as_secs_f64();
            assert!((base * 0.7..=base * 1.3).contains(&secs), "{}", secs);
        }

        pacer.note_flood_wait();
        pacer.note_flood_wait();
        for _ in 0..16 {
            let secs = pacer.current_interval().as_secs_f64();
            assert!((base * 4.0 * 0.7..=base * 4.0 * 1.3).contains(&secs), "{}", secs);
        }
    }

    #[test]
    fn test_interval_capped_under_max_penalty() {
        let pacer = UpstreamPacer::new(
            2,
            0.2, // 5s base
            &RetryConfig {
                jitter_factor: 0.0,
                ..RetryConfig::default()
            },
        );
        for _ in 0..10 {
            pacer.note_flood_wait();
        }
        assert_eq!(pacer.current_interval(), MAX_INTERVAL);
    }
}
