use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::shared::error::{LabError, LabResult};

/// Exponential backoff with up to 20% random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
            factor: 2,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * self.factor).min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max.max(base))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }
}

/// Run `op` up to `attempts` times, retrying only retryable lab errors.
pub async fn retry_transient<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> LabResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LabResult<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = Backoff::default();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Collapse an exhausted retry into the error the caller should see.
pub fn exhausted(what: &str, err: LabError) -> LabError {
    match err {
        LabError::ContainerRuntime(msg) => {
            LabError::ContainerRuntime(format!("{} failed after retries: {}", what, msg))
        }
        other => other,
    }
}
