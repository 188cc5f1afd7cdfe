use std::future::Future;
use std::time::Duration;

use tracing::{debug, error};

/// Exponential backoff for connection attempts. The first retry waits
/// `initial`, each later one twice as long, never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub retries: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            retries,
            initial,
            max,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds or the retries are spent. The last error
    /// is returned unchanged.
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;
            if attempt > self.retries {
                error!(operation = what, attempts = attempt, error = %err, "Giving up");
                return Err(err);
            }
            let delay = self.delay(attempt);
            debug!(
                operation = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
