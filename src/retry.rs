//! Bounded retries with backoff.
//!
//! The controller re-runs an operation only for transient warehouse
//! failures; everything else aborts immediately. Backoff follows the
//! configured strategy, every sleep races the shutdown token, and an
//! optional cumulative bound caps the total time spent waiting.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{RetriesConfig, RetryStrategy};
use crate::error::{DbError, LoaderError};

/// Backoff policy derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    pub attempts: usize,
    backoff: Duration,
    max_backoff: Duration,
    cumulative_bound: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetriesConfig) -> Self {
        Self {
            strategy: config.strategy,
            attempts: config.attempts,
            backoff: Duration::from_secs(config.backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            cumulative_bound: config.cumulative_bound_secs.map(Duration::from_secs),
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    fn delay(&self, attempt: usize) -> Duration {
        let base = match self.strategy {
            RetryStrategy::Constant => self.backoff,
            RetryStrategy::Fibonacci => self.backoff.mul_f64(fibonacci(attempt) as f64),
            RetryStrategy::Jitter => {
                let exponential = self.backoff.mul_f64(2f64.powi(attempt as i32 - 1));
                let factor = rand::thread_rng().gen_range(0.5..1.5);
                exponential.mul_f64(factor)
            }
        };
        base.min(self.max_backoff)
    }
}

fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Whether an error is worth another attempt.
fn is_transient(error: &LoaderError) -> Option<&DbError> {
    match error {
        LoaderError::Db { source } if source.is_transient() => Some(source),
        _ => None,
    }
}

/// Run `op` up to `policy.attempts` times. `on_retry` fires once per
/// re-execution (not for the first attempt), letting the control surface
/// count attempts. Shutdown cancels any pending sleep.
pub async fn retry_on_transient<'a, T>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut on_retry: impl FnMut(usize),
    mut op: impl FnMut() -> Pin<Box<dyn Future<Output = Result<T, LoaderError>> + Send + 'a>> + 'a,
) -> Result<T, LoaderError> {
    let mut attempt = 1;
    let mut slept = Duration::ZERO;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(db_error) = is_transient(&error) else {
            return Err(error);
        };

        if attempt >= policy.attempts {
            return Err(LoaderError::RetriesExhausted {
                attempts: attempt,
                source: DbError::transient(db_error.to_string()),
            });
        }

        let delay = policy.delay(attempt);
        if let Some(bound) = policy.cumulative_bound
            && slept + delay > bound
        {
            warn!("Cumulative retry bound reached after {attempt} attempts");
            return Err(LoaderError::RetriesExhausted {
                attempts: attempt,
                source: DbError::transient(db_error.to_string()),
            });
        }

        warn!(
            attempt,
            delay_secs = delay.as_secs(),
            "Transient failure, retrying: {error}"
        );
        on_retry(attempt);

        tokio::select! {
            _ = shutdown.cancelled() => return Err(LoaderError::runtime("shutdown")),
            _ = tokio::time::sleep(delay) => {}
        }
        slept += delay;
        attempt += 1;
    }
}
