//! Exponential backoff used by checkout retries and connection replenishment.

use crate::policy::Policy;

use rand::{rng, Rng};
use tokio::time::{Duration, Instant};

/// Substituted when a caller asks for a zero base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

// Attempts beyond this no longer grow the exponent.
const MAX_EXPONENT: u32 = 16;

/// Computes the delay to wait after `attempts` consecutive failures.
///
/// - Zero attempts never wait.
/// - Otherwise the delay is `base * 2^(attempts - 1)`, capped at `max`.
///
/// A zero `base` is replaced by [DEFAULT_BASE_DELAY].
pub fn delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let base = if base.is_zero() {
        DEFAULT_BASE_DELAY
    } else {
        base
    };
    let exponent = std::cmp::min(attempts - 1, MAX_EXPONENT);
    base.saturating_mul(1 << exponent).min(max)
}

pub(crate) trait Spread: Sized {
    fn add_spread(&self, spread: Duration) -> Self;
}

impl Spread for Duration {
    fn add_spread(&self, spread: Duration) -> Self {
        if spread.is_zero() {
            return *self;
        }
        let nanos = u64::try_from(spread.as_nanos()).unwrap_or(u64::MAX);
        let jitter = rng().random_range(0..nanos);
        self.saturating_add(Duration::from_nanos(jitter))
    }
}

/// Paces the rounds of a single checkout.
#[derive(Debug)]
pub(crate) struct CheckoutRetry {
    started: Instant,
    attempts: u32,
    min: Duration,
    max: Duration,
    limit: Option<Duration>,
}

impl CheckoutRetry {
    pub(crate) fn new(policy: &Policy) -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
            min: policy.min_checkout_retry_delay,
            max: policy.max_checkout_retry_delay,
            limit: policy.max_checkout_wait,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleeps before the next round.
    ///
    /// Returns the time spent so far as an error once the checkout has
    /// waited as long as it may. The final sleep is shortened so the limit
    /// is not overshot.
    pub(crate) async fn backoff(&mut self) -> Result<(), Duration> {
        let elapsed = self.elapsed();
        let remaining = match self.limit {
            Some(limit) if elapsed >= limit => return Err(elapsed),
            Some(limit) => Some(limit - elapsed),
            None => None,
        };
        self.attempts = self.attempts.saturating_add(1);
        let mut wait = delay(self.attempts, self.min, self.max);
        if let Some(remaining) = remaining {
            wait = wait.min(remaining);
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }
}
