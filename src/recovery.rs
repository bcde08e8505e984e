//! Error recovery: jittered backoff retries, flood-wait pacing, and log
//! redaction.
//!
//! Every delay produced here carries random jitter; constant-delay retries
//! are forbidden (timing-analysis resistance). Error text bound for logs or
//! the archive goes through [`Redactor`] first.

use crate::config::RetryConfig;
use crate::error::{Error, ErrorCategory, Result};
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Jitter applied to flood-wait sleeps (fraction of the requested wait)
const FLOOD_WAIT_JITTER: f64 = 0.2;

/// Floor for any flood-wait sleep
const MIN_FLOOD_WAIT: Duration = Duration::from_secs(1);

/// Retry pacing derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs_f64(config.base_delay_secs.max(0.1)),
            max_delay: Duration::from_secs_f64(config.max_delay_secs.max(1.0)),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Exponential delay for a retry attempt (0-based) with symmetric
    /// jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        jittered(exp, self.jitter_factor, Duration::from_millis(100))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(&RetryConfig::default())
    }
}

/// Sleep duration honoring an upstream flood wait: the requested seconds
/// with ±20 % jitter, never below one second.
pub fn flood_wait_delay(seconds: u32) -> Duration {
    jittered(
        Duration::from_secs(u64::from(seconds)),
        FLOOD_WAIT_JITTER,
        MIN_FLOOD_WAIT,
    )
}

fn jittered(base: Duration, factor: f64, floor: Duration) -> Duration {
    if factor <= 0.0 {
        return base.max(floor);
    }
    let jitter = rand::thread_rng().gen_range(-factor..=factor);
    let secs = base.as_secs_f64() * (1.0 + jitter);
    Duration::from_secs_f64(secs.max(floor.as_secs_f64()))
}

/// Run an upstream operation under the retry policy.
///
/// Flood waits honor the announced delay (plus jitter) and then retry with
/// the same logical operation. Recoverable errors back off exponentially up
/// to the retry limit. Unknown errors get exactly one retry before being
/// treated as fatal. Auth and permission errors surface immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    let mut unknown_retries: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::RateLimited { seconds }) => {
                if attempt >= policy.max_retries {
                    return Err(Error::RateLimited { seconds });
                }
                let delay = flood_wait_delay(seconds);
                warn!("{}: rate limited, waiting {:.1}s", context, delay.as_secs_f64());
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) => {
                if e.category() == ErrorCategory::Unknown {
                    if unknown_retries >= 1 {
                        return Err(e);
                    }
                    unknown_retries += 1;
                }
                if attempt >= policy.max_retries {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt);
                info!(
                    "{}: retry {}/{} after {:.2}s ({})",
                    context,
                    attempt + 1,
                    policy.max_retries,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Strips credential material from text before it reaches logs or the
/// archive.
pub struct Redactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl Redactor {
    pub fn new() -> Self {
        let patterns = vec![
            (
                Regex::new(r#"(?i)password["']?\s*[:=]\s*["']?[^"'\s]+"#).unwrap(),
                "password=<REDACTED>",
            ),
            (
                Regex::new(r#"(?i)token["']?\s*[:=]\s*["']?[^"'\s]+"#).unwrap(),
                "token=<REDACTED>",
            ),
            (
                Regex::new(r#"(?i)api[_-]?hash["']?\s*[:=]\s*["']?[^"'\s]+"#).unwrap(),
                "api_hash=<REDACTED>",
            ),
            (
                Regex::new(r#"(?i)api[_-]?id["']?\s*[:=]\s*["']?\d+"#).unwrap(),
                "api_id=<REDACTED>",
            ),
            (
                Regex::new(r#"(?i)session["']?\s*[:=]\s*["']?[^"'\s]+"#).unwrap(),
                "session=<REDACTED>",
            ),
            (
                Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap(),
                "Bearer <REDACTED>",
            ),
            (Regex::new(r"\d{10,}:\w{35}").unwrap(), "<BOT_TOKEN_REDACTED>"),
            (
                Regex::new(r"[A-Za-z0-9+/=]{50,}").unwrap(),
                "<BASE64_REDACTED>",
            ),
        ];
        Redactor { patterns }
    }

    /// Replace every sensitive pattern occurrence.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.patterns {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out
    }

    /// Redacted single-line rendering of an error, suitable for queue rows.
    pub fn short_error(&self, e: &Error) -> String {
        let text = self.redact(&e.to_string());
        match text.char_indices().nth(120) {
            Some((idx, _)) => text[..idx].to_string(),
            None => text,
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Redactor::new()
    }
}

/// Fixed-width buffer length for credential comparison
const CREDENTIAL_WIDTH: usize = 64;

/// Constant-time equality over credential strings. Both sides are copied
/// into constant-length buffers so the comparison cost does not depend on
/// their content or length.
pub fn credentials_match(a: &str, b: &str) -> bool {
    if a.len() > CREDENTIAL_WIDTH || b.len() > CREDENTIAL_WIDTH {
        return a == b;
    }
    let mut buf_a = [0u8; CREDENTIAL_WIDTH];
    let mut buf_b = [0u8; CREDENTIAL_WIDTH];
    buf_a[..a.len()].copy_from_slice(a.as_bytes());
    buf_b[..b.len()].copy_from_slice(b.as_bytes());
    let equal_content = ring::constant_time::verify_slices_are_equal(&buf_a, &buf_b).is_ok();
    equal_content && a.len() == b.len()
}
