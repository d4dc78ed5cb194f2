use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt, without consuming it
    pub fn next_delay(&self) -> Duration {
        let factor = 2_u64.saturating_pow(self.current_attempt);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_max() {
        let mut backoff = ExponentialBackoff::new(100, 350, 5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        backoff.current_attempt = 1;
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        backoff.current_attempt = 2;
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut backoff = ExponentialBackoff::new(10, 100, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(backoff.sleep().await.is_ok());
    }
}
