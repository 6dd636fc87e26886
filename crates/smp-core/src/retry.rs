//! Exponential backoff retry for reconnecting the data channel.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::constants::{
    DATA_CHANNEL_NUM_MAX_RETRIES, DATA_CHANNEL_RETRY_INITIAL_DELAY_MILLIS,
    DATA_CHANNEL_RETRY_MAX_INTERVAL_MILLIS, RETRY_BASE,
};
use crate::error::Result;

/// Backoff retryer with a geometric delay curve.
///
/// When the computed delay exceeds the cap the curve restarts from the
/// initial delay; the attempt budget keeps counting across restarts.
#[derive(Debug, Clone)]
pub struct RepeatableExponentialRetryer {
    geometric_ratio: f64,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl RepeatableExponentialRetryer {
    /// Create a retryer with explicit parameters.
    pub fn new(
        geometric_ratio: f64,
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            geometric_ratio,
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Retryer tuned for data channel reconnection: ratio 2, initial delay
    /// randomized in [100, 200) ms, 5 s cap, 5 attempts.
    pub fn for_data_channel() -> Self {
        let initial = DATA_CHANNEL_RETRY_INITIAL_DELAY_MILLIS
            + rand::thread_rng().gen_range(0..DATA_CHANNEL_RETRY_INITIAL_DELAY_MILLIS);
        Self::new(
            RETRY_BASE,
            Duration::from_millis(initial),
            Duration::from_millis(DATA_CHANNEL_RETRY_MAX_INTERVAL_MILLIS),
            DATA_CHANNEL_NUM_MAX_RETRIES,
        )
    }

    /// Delay before the retry with the given zero-based attempt index.
    pub fn next_sleep_time(&self, attempt: u32) -> Duration {
        self.initial_delay
            .mul_f64(self.geometric_ratio.powi(attempt as i32))
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    pub async fn call<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut failed_attempts = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if failed_attempts == self.max_attempts {
                        return Err(err);
                    }
                    let mut sleep = self.next_sleep_time(attempt);
                    if sleep > self.max_delay {
                        attempt = 0;
                        sleep = self.next_sleep_time(attempt);
                    }
                    debug!(attempt = failed_attempts, delay_ms = sleep.as_millis() as u64, "retrying after failure");
                    tokio::time::sleep(sleep).await;
                    attempt += 1;
                    failed_attempts += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retryer(max_attempts: u32) -> RepeatableExponentialRetryer {
        RepeatableExponentialRetryer::new(
            2.0,
            Duration::from_millis(1),
            Duration::from_millis(8),
            max_attempts,
        )
    }

    #[test]
    fn delay_curve_is_geometric() {
        let retryer = RepeatableExponentialRetryer::new(
            2.0,
            Duration::from_millis(100),
            Duration::from_secs(5),
            5,
        );
        assert_eq!(retryer.next_sleep_time(0), Duration::from_millis(100));
        assert_eq!(retryer.next_sleep_time(1), Duration::from_millis(200));
        assert_eq!(retryer.next_sleep_time(2), Duration::from_millis(400));
        assert_eq!(retryer.next_sleep_time(3), Duration::from_millis(800));
    }

    #[test]
    fn data_channel_retryer_initial_delay_is_randomized() {
        for _ in 0..16 {
            let retryer = RepeatableExponentialRetryer::for_data_channel();
            let initial = retryer.next_sleep_time(0);
            assert!(initial >= Duration::from_millis(100));
            assert!(initial < Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn returns_after_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        fast_retryer(5)
            .call(move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        fast_retryer(5)
            .call(move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(Error::ChannelClosed)
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let err = fast_retryer(3)
            .call(move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::ChannelClosed)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChannelClosed));
        // initial call plus max_attempts retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
