//! Caller-side retries for attribute operations.
//!
//! The connection never retries an operation on its own; a failed read or
//! write is reported once. [`with_retry`] lets callers opt in, retrying
//! only failures that [`is_retryable`] classifies as transient.
//!
//! # Example
//!
//! ```
//! use gattlink_core::{with_retry, Error, RetryConfig};
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::for_read();
//! let value = with_retry(&config, "read battery level", || async {
//!     // connection.read(BATTERY_SERVICE, BATTERY_LEVEL).await
//!     Ok::<_, Error>(87u8)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use gattlink_types::GattStatus;

use crate::error::{Error, Result};
use crate::state::ConnectionState;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 means no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay between retries.
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Connect attempts: the peripheral may be busy or still advertising slowly.
    pub fn for_connect() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Characteristic reads.
    pub fn for_read() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Characteristic and descriptor writes.
    ///
    /// A retried chunked write starts over from the first chunk.
    pub fn for_write() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Short, time-sensitive operations.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `retry` (zero-based).
    fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.jitter {
            Duration::from_secs_f64(secs * (1.0 + rand::rng().random::<f64>() * 0.25))
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `operation`, retrying transient failures per `config`.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once the retries are spent.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(operation = operation_name, retries = retry, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if retry < config.max_retries && is_retryable(&e) => {
                let delay = config.delay_for_retry(retry);
                warn!(
                    operation = operation_name,
                    attempt = retry + 1,
                    attempts = config.max_retries + 1,
                    ?delay,
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether `error` is worth retrying.
///
/// Link-level failures, timeouts and congestion-type statuses are
/// transient. Protocol rejections (not permitted, not supported),
/// lookup failures and a closed connection are not.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Timeout { .. } | Error::Bluetooth(_) | Error::PlatformRejected { .. } => true,
        Error::Link { .. } | Error::Discovery { .. } => true,
        Error::Operation { status, .. } => is_transient_status(*status),
        Error::ChunkedWrite { source, .. } => is_retryable(source),
        // A connection that is still coming up will accept the request shortly.
        Error::InvalidState { state, .. } => matches!(
            state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::DiscoveringAttributes
        ),
        Error::ConnectionClosed
        | Error::Cancelled
        | Error::DuplicateRequest { .. }
        | Error::AttributeNotFound { .. }
        | Error::NotSupported { .. }
        | Error::InvalidConfig(_)
        | Error::InvalidData(_) => false,
    }
}

fn is_transient_status(status: GattStatus) -> bool {
    matches!(
        status,
        GattStatus::GATT_ERROR
            | GattStatus::CONNECTION_CONGESTED
            | GattStatus::CONNECTION_TIMEOUT
            | GattStatus::FAILURE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn operation_error(status: GattStatus) -> Error {
        Error::operation(OperationKind::ReadCharacteristic, None, status)
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::default().max_retries, 3);
        assert_eq!(RetryConfig::none().max_retries, 0);
        assert!(!RetryConfig::quick().jitter);
        assert!(RetryConfig::for_connect().initial_delay > RetryConfig::for_read().initial_delay);
    }

    #[test]
    fn test_delay_backs_off_and_caps() {
        let config = RetryConfig::default()
            .jitter(false)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(400));

        assert_eq!(config.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_retry(30), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::default().initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = config.delay_for_retry(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&Error::timeout("read", Duration::from_secs(1))));
        assert!(is_retryable(&operation_error(GattStatus::GATT_ERROR)));
        assert!(is_retryable(&operation_error(GattStatus::CONNECTION_CONGESTED)));
        assert!(!is_retryable(&operation_error(GattStatus::READ_NOT_PERMITTED)));
        assert!(!is_retryable(&operation_error(GattStatus::INSUFFICIENT_AUTHENTICATION)));
        assert!(!is_retryable(&Error::ConnectionClosed));
        assert!(!is_retryable(&Error::attribute_not_found("180f", "2a19")));
        assert!(is_retryable(&Error::InvalidState {
            operation: "read",
            state: ConnectionState::DiscoveringAttributes,
        }));
        assert!(!is_retryable(&Error::InvalidState {
            operation: "read",
            state: ConnectionState::Disconnected,
        }));
    }

    #[test]
    fn test_chunked_write_follows_its_source() {
        let transient = Error::ChunkedWrite {
            chunk: 2,
            chunks: 4,
            offset: 182,
            source: Box::new(operation_error(GattStatus::GATT_ERROR)),
        };
        let permanent = Error::ChunkedWrite {
            chunk: 1,
            chunks: 4,
            offset: 0,
            source: Box::new(operation_error(GattStatus::WRITE_NOT_PERMITTED)),
        };
        assert!(is_retryable(&transient));
        assert!(!is_retryable(&permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&RetryConfig::new(3), "read", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(operation_error(GattStatus::GATT_ERROR))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_permanent_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(&RetryConfig::new(5), "read", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::ConnectionClosed)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(&RetryConfig::new(2), "write", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::timeout("write", Duration::from_secs(1)))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
