//! Device acquisition: enumerate attached keys and open the first usable one,
//! retrying while keys are present but busy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use tracing::{debug, info, instrument, warn};

use super::{DeviceEnumerator, DeviceOpenOutcome, SecurityKey};
use crate::error::{DeviceError, KeytapError, Result};

/// Maximum number of enumerate-and-open attempts.
pub const MAX_OPEN_RETRIES: u32 = 10;

/// Fixed delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Retry policy for [`acquire_device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep between two attempts. Does not grow.
    pub retry_delay: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_OPEN_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }
}

impl AcquireConfig {
    fn build_backoff(&self) -> FixedDelay {
        FixedDelay::new(self.retry_delay, self.max_attempts.saturating_sub(1))
    }
}

/// Constant-delay backoff allowing a fixed number of retries.
#[derive(Debug)]
struct FixedDelay {
    delay: Duration,
    retries: u32,
    remaining: u32,
}

impl FixedDelay {
    fn new(delay: Duration, retries: u32) -> Self {
        Self {
            delay,
            retries,
            remaining: retries,
        }
    }
}

impl Backoff for FixedDelay {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Why a single acquisition attempt failed.
#[derive(Debug)]
enum OpenFailure {
    NotPresent,
    Transient(DeviceError),
}

/// Enumerate keys once and open the first one that accepts.
///
/// Keys that fail to open are closed (best effort) before the next one is
/// tried. Only one key is ever returned; the remaining handles are dropped
/// unopened.
pub async fn open_first(enumerator: &dyn DeviceEnumerator) -> DeviceOpenOutcome {
    let devices = match enumerator.devices() {
        Ok(devices) => devices,
        Err(e) => {
            debug!(error = %e, "Device enumeration failed");
            return DeviceOpenOutcome::TransientFailure(e);
        }
    };

    if devices.is_empty() {
        return DeviceOpenOutcome::NotPresent;
    }

    let mut last_error = None;
    for mut device in devices {
        match device.open().await {
            Ok(()) => {
                debug!(device = %device.description(), "Opened security key");
                return DeviceOpenOutcome::Opened(device);
            }
            Err(e) => {
                debug!(device = %device.description(), error = %e, "Failed to open device");
                if let Err(close_err) = device.close() {
                    debug!(error = %close_err, "Ignoring close error after failed open");
                }
                last_error = Some(e);
            }
        }
    }

    DeviceOpenOutcome::TransientFailure(
        last_error.unwrap_or_else(|| DeviceError::Hid("no device could be opened".into())),
    )
}

/// Obtain an opened key, retrying busy or unavailable devices.
///
/// An empty enumeration fails immediately with
/// [`KeytapError::NoDeviceFound`]; waiting for a key to be plugged in is up
/// to the caller. Other failures are retried up to
/// [`AcquireConfig::max_attempts`] times with a fixed delay, after which
/// [`KeytapError::OpenExhausted`] reports the last cause.
#[instrument(
    level = "info",
    skip_all,
    fields(
        max_attempts = config.max_attempts,
        retry_delay_ms = config.retry_delay.as_millis() as u64
    )
)]
pub async fn acquire_device(
    enumerator: &dyn DeviceEnumerator,
    config: &AcquireConfig,
) -> Result<Box<dyn SecurityKey>> {
    let start = Instant::now();
    let attempts = AtomicU32::new(0);
    let attempts_ref = &attempts;

    let result = retry_notify(
        config.build_backoff(),
        move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(attempt, "Enumerating security keys");
            match open_first(enumerator).await {
                DeviceOpenOutcome::Opened(device) => Ok(device),
                DeviceOpenOutcome::NotPresent => {
                    Err(backoff::Error::permanent(OpenFailure::NotPresent))
                }
                DeviceOpenOutcome::TransientFailure(cause) => {
                    Err(backoff::Error::transient(OpenFailure::Transient(cause)))
                }
            }
        },
        |failure: OpenFailure, duration: Duration| {
            warn!(
                error = ?failure,
                retry_after_ms = duration.as_millis() as u64,
                "Retry scheduled"
            );
        },
    )
    .await;

    let total_ms = start.elapsed().as_millis() as u64;
    let attempts = attempts.load(Ordering::SeqCst);

    match result {
        Ok(device) => {
            info!(
                device = %device.description(),
                attempts,
                total_latency_ms = total_ms,
                "Security key acquired"
            );
            Ok(device)
        }
        Err(OpenFailure::NotPresent) => {
            warn!("No U2F devices attached");
            Err(KeytapError::NoDeviceFound)
        }
        Err(OpenFailure::Transient(cause)) => {
            warn!(
                error = %cause,
                attempts,
                total_latency_ms = total_ms,
                "Failed to open a security key after all retries"
            );
            Err(KeytapError::OpenExhausted {
                cause,
                retries: attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockBehavior, MockCounters, MockEnumerator, MockSecurityKey};

    fn busy() -> DeviceError {
        DeviceError::Hid("device busy".into())
    }

    #[test]
    fn test_default_config() {
        let config = AcquireConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_fixed_delay_allows_exact_retries() {
        let mut backoff = FixedDelay::new(RETRY_DELAY, 2);
        assert_eq!(backoff.next_backoff(), Some(RETRY_DELAY));
        assert_eq!(backoff.next_backoff(), Some(RETRY_DELAY));
        assert_eq!(backoff.next_backoff(), None);
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(RETRY_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_enumeration_fails_immediately() {
        let counters = MockCounters::new();
        let enumerator = MockEnumerator::empty(counters.clone());
        let start = tokio::time::Instant::now();

        let result = acquire_device(&enumerator, &AcquireConfig::default()).await;

        assert!(matches!(result, Err(KeytapError::NoDeviceFound)));
        assert_eq!(counters.enumerations(), 1);
        assert!(start.elapsed() < RETRY_DELAY, "no retry sleep expected");
    }

    #[tokio::test]
    async fn test_skips_devices_that_fail_to_open() {
        let counters = MockCounters::new();
        let key_counters = counters.clone();
        let enumerator = MockEnumerator::new(counters.clone(), move |_| {
            let mut keys: Vec<Box<dyn SecurityKey>> = Vec::new();
            for i in 0..3 {
                keys.push(Box::new(
                    MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                        .labeled(format!("broken-{i}"))
                        .failing_open(busy()),
                ));
            }
            keys.push(Box::new(
                MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                    .labeled("good"),
            ));
            Ok(keys)
        });

        let device = acquire_device(&enumerator, &AcquireConfig::default())
            .await
            .unwrap();

        assert_eq!(device.description(), "good");
        assert_eq!(counters.enumerations(), 1);
        assert_eq!(counters.opens(), 4);
        assert_eq!(counters.closes(), 3, "each failed open must be closed");
    }

    #[tokio::test]
    async fn test_close_error_after_failed_open_is_ignored() {
        let counters = MockCounters::new();
        let key_counters = counters.clone();
        let enumerator = MockEnumerator::new(counters.clone(), move |_| {
            Ok(vec![
                Box::new(
                    MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                        .labeled("wedged")
                        .failing_open(busy())
                        .failing_close(DeviceError::Hid("close failed".into())),
                ) as Box<dyn SecurityKey>,
                Box::new(
                    MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                        .labeled("good"),
                ),
            ])
        });

        let device = acquire_device(&enumerator, &AcquireConfig::default())
            .await
            .unwrap();

        assert_eq!(device.description(), "good");
        assert_eq!(counters.enumerations(), 1);
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_attempts() {
        let counters = MockCounters::new();
        let key_counters = counters.clone();
        let enumerator = MockEnumerator::new(counters.clone(), move |attempt| {
            let key =
                MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                    .labeled(format!("attempt-{attempt}"));
            let key = if attempt < 3 { key.failing_open(busy()) } else { key };
            Ok(vec![Box::new(key) as Box<dyn SecurityKey>])
        });
        let start = tokio::time::Instant::now();

        let device = acquire_device(&enumerator, &AcquireConfig::default())
            .await
            .unwrap();

        assert_eq!(device.description(), "attempt-3");
        assert_eq!(counters.enumerations(), 4);
        assert_eq!(counters.closes(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= RETRY_DELAY * 3 && elapsed < RETRY_DELAY * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retry_budget() {
        let counters = MockCounters::new();
        let key_counters = counters.clone();
        let enumerator = MockEnumerator::new(counters.clone(), move |attempt| {
            let cause = DeviceError::Hid(format!("busy on attempt {attempt}"));
            Ok(vec![Box::new(
                MockSecurityKey::with_counters(MockBehavior::NeverTouched, key_counters.clone())
                    .failing_open(cause),
            ) as Box<dyn SecurityKey>])
        });
        let start = tokio::time::Instant::now();

        let result = acquire_device(&enumerator, &AcquireConfig::default()).await;

        match result {
            Err(KeytapError::OpenExhausted { cause, retries }) => {
                assert_eq!(retries, MAX_OPEN_RETRIES);
                assert_eq!(cause, DeviceError::Hid("busy on attempt 9".into()));
            }
            other => panic!("expected OpenExhausted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(counters.enumerations(), MAX_OPEN_RETRIES as usize);
        assert_eq!(counters.closes(), MAX_OPEN_RETRIES as usize);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= RETRY_DELAY * (MAX_OPEN_RETRIES - 1)
                && elapsed < RETRY_DELAY * MAX_OPEN_RETRIES,
            "expected one delay between each pair of attempts, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumeration_error_is_retried() {
        let counters = MockCounters::new();
        let enumerator = MockEnumerator::new(counters.clone(), |_| {
            Err(DeviceError::Hid("hidapi init failed".into()))
        });
        let config = AcquireConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
        };

        let result = acquire_device(&enumerator, &config).await;

        assert!(matches!(
            result,
            Err(KeytapError::OpenExhausted { retries: 3, .. })
        ));
        assert_eq!(counters.enumerations(), 3);
    }
}
