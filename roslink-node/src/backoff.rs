//! Truncated exponential backoff with jitter.

use crate::cancel::CancelToken;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Default ceiling on a single backoff delay (10 seconds).
pub const DEFAULT_CAP_MS: u64 = 10_000;

/// Default maximum jitter added to a delay (1 second).
pub const DEFAULT_JITTER_MAX_MS: u64 = 1_000;

/// Backoff schedule: `min(2^retries + rand * jitter_max, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    cap: Duration,
    jitter_max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            cap: Duration::from_millis(DEFAULT_CAP_MS),
            jitter_max: Duration::from_millis(DEFAULT_JITTER_MAX_MS),
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_jitter_max(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    /// Delay before retry number `retries`, with fresh random jitter.
    pub fn delay(&self, retries: u32) -> Duration {
        self.delay_with_jitter(retries, rand::rng().random::<f64>())
    }

    /// Delay with an explicit jitter fraction in `[0, 1)`.
    ///
    /// The exponent saturates once `2^retries` reaches the cap, so large
    /// retry counts neither overflow nor grow the delay further.
    pub fn delay_with_jitter(&self, retries: u32, jitter: f64) -> Duration {
        let cap_ms = self.cap.as_millis() as u64;
        let base_ms = if retries >= 63 {
            cap_ms
        } else {
            (1u64 << retries).min(cap_ms)
        };
        let jitter_ms = (jitter * self.jitter_max.as_millis() as f64) as u64;
        Duration::from_millis((base_ms + jitter_ms).min(cap_ms))
    }
}

/// Invokes `op` until it succeeds, sleeping a backoff delay between
/// attempts (attempt count starts at 1).
///
/// Returns `None` if the token is cancelled: the pending sleep ends
/// early and `op` is not invoked again.
pub async fn retry_forever<T, E, F, Fut>(
    backoff: &Backoff,
    token: &CancelToken,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            return None;
        }

        match op().await {
            Ok(value) => return Some(value),
            Err(e) => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                tracing::debug!("attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return None,
                }
            }
        }
    }
}
