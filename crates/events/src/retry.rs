//! Reconnection strategy for broker clients.
//!
//! The core imposes no timeouts or backoff of its own; callers plug in a policy.

use std::time::Duration;

use tracing::warn;

use crate::broker::{Broker, BrokerError};

/// Decides whether (and after how long) to try again after a transport failure.
pub trait ReconnectPolicy: Send + Sync + core::fmt::Debug {
    /// Delay before attempt number `attempt` (1-based), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Fail on the first error.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoRetry;

impl ReconnectPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Connect, retrying transport failures as long as `policy` allows.
///
/// The last error is returned once the policy gives up.
pub async fn connect_with_retry(
    broker: &dyn Broker,
    policy: &dyn ReconnectPolicy,
) -> Result<(), BrokerError> {
    let mut attempt = 0u32;
    loop {
        match broker.connect().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                match policy.next_delay(attempt) {
                    Some(delay) => {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "broker connect failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ExponentialBackoff {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn no_retry_never_waits() {
        assert_eq!(NoRetry.next_delay(1), None);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let policy = ExponentialBackoff {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            factor: 1.0,
        };

        let err = connect_with_retry(&broker, &policy).await.unwrap_err();

        assert!(matches!(err, BrokerError::Unreachable { .. }));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn succeeds_once_reachable() {
        let broker = InMemoryBroker::new();
        connect_with_retry(&broker, &NoRetry).await.unwrap();
        assert!(broker.is_connected());
    }
}
