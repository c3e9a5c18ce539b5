use std::time::Duration;

use crate::config::RetryStrategy;

/// Retry budget shared by query attempts and HTTP chunk sends of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub strategy: RetryStrategy,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay to wait after the failed `attempt` (1-based) before the next one
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Delay => self.backoff,
            RetryStrategy::ExponentialBackoff => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.backoff.saturating_mul(1u32 << exponent)
            }
        }
    }
}
