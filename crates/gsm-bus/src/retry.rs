use std::time::Duration;

use uuid::Uuid;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let pow = attempt.min(16); // prevent overflow
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(1u64 << pow).min(max_ms);
        let jitter = if capped == 0 {
            0
        } else {
            (Uuid::new_v4().as_u128() % u128::from(capped)) as u64
        };
        Duration::from_millis(capped.saturating_add(jitter).min(max_ms))
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}
