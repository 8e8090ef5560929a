//! Challenge session: drives one touch-confirmed U2F authentication.
//!
//! The session polls the key on a fixed tick until it signs, fails, or the
//! overall deadline passes:
//!
//! ```text
//! Polling ──valid response──────────────► Succeeded
//!    │  ╰──user presence required──╮
//!    │         (prompt once)       │
//!    │◄────────────────────────────╯
//!    ├──any other device error─────────► Failed
//!    ╰──deadline elapsed────────────────► TimedOut
//! ```
//!
//! The device is closed on every exit, including when the future returned
//! by [`ChallengeSession::run_challenge`] is dropped mid-flight.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::device::{AuthenticateRequest, SecurityKey};
use crate::error::{DeviceError, KeytapError, Result};

/// Overall time allowed for the user to touch the key.
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(25);

/// Interval between two authenticate requests.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Parameters of one U2F challenge, as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParameters {
    pub challenge_nonce: String,
    pub app_id: String,
    pub version: String,
    /// Web-safe base64 credential id registered for this key.
    pub key_handle: String,
    pub state_token: String,
}

impl ChallengeParameters {
    /// The request sent on every tick. The app id is the only facet.
    pub fn authenticate_request(&self) -> AuthenticateRequest {
        AuthenticateRequest {
            challenge: self.challenge_nonce.clone(),
            facet: self.app_id.clone(),
            app_id: self.app_id.clone(),
            key_handle: self.key_handle.clone(),
        }
    }
}

/// Proof of touch plus challenge response, ready to send back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAssertion {
    pub state_token: String,
    pub client_data: String,
    pub signature_data: String,
}

/// Timing of the poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: CHALLENGE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// User-visible notices emitted during a session.
pub trait TouchNotifier: Send + Sync {
    /// The key is waiting for a touch. Called at most once per session.
    fn touch_required(&self);

    /// The key signed the challenge.
    fn touch_accepted(&self);
}

/// Writes the notices to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrNotifier;

impl TouchNotifier for StderrNotifier {
    fn touch_required(&self) {
        eprintln!("\nTouch the flashing U2F device to authenticate...");
    }

    fn touch_accepted(&self) {
        eprintln!("  ==> Touch accepted. Proceeding with authentication");
    }
}

/// Closes the wrapped key when dropped.
struct DeviceGuard {
    device: Box<dyn SecurityKey>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        match self.device.close() {
            Ok(()) => debug!(device = %self.device.description(), "Released security key"),
            Err(e) => warn!(error = %e, "Failed to close security key"),
        }
    }
}

/// One authentication attempt against one key.
pub struct ChallengeSession {
    params: ChallengeParameters,
    device: Option<Box<dyn SecurityKey>>,
    config: SessionConfig,
    notifier: Arc<dyn TouchNotifier>,
    prompted: bool,
}

impl ChallengeSession {
    pub fn new(params: ChallengeParameters) -> Self {
        Self {
            params,
            device: None,
            config: SessionConfig::default(),
            notifier: Arc::new(StderrNotifier),
            prompted: false,
        }
    }

    /// Attach the acquired key. The session takes exclusive ownership.
    pub fn with_device(mut self, device: Box<dyn SecurityKey>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TouchNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Poll the key until it signs, fails, or the deadline passes.
    ///
    /// # Errors
    ///
    /// - [`KeytapError::NoDeviceHandle`] if no key was attached
    /// - [`KeytapError::DeviceProtocol`] on any device error other than
    ///   "user presence required"; no further requests are made
    /// - [`KeytapError::Timeout`] if the deadline elapses first
    #[instrument(
        level = "info",
        skip(self),
        fields(
            app_id = %self.params.app_id,
            timeout_ms = self.config.timeout.as_millis() as u64,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64
        )
    )]
    pub async fn run_challenge(mut self) -> Result<SignedAssertion> {
        let device = self.device.take().ok_or(KeytapError::NoDeviceHandle)?;
        let mut guard = DeviceGuard { device };
        let request = self.params.authenticate_request();

        let start = Instant::now();
        let deadline = sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut ticker = interval_at(start + self.config.poll_interval, self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => return Err(self.timed_out(tick)),
                _ = ticker.tick() => {}
            }
            tick += 1;

            let outcome = tokio::select! {
                biased;
                () = &mut deadline => return Err(self.timed_out(tick)),
                outcome = guard.device.authenticate(&request) => outcome,
            };

            match outcome {
                Ok(response) => {
                    info!(
                        tick,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Touch accepted"
                    );
                    self.notifier.touch_accepted();
                    return Ok(SignedAssertion {
                        state_token: self.params.state_token.clone(),
                        client_data: response.client_data,
                        signature_data: response.signature_data,
                    });
                }
                Err(DeviceError::UserPresenceRequired) => {
                    debug!(tick, "Waiting for user presence");
                    if !self.prompted {
                        self.notifier.touch_required();
                        self.prompted = true;
                    }
                }
                Err(e) => {
                    warn!(tick, error = %e, "Security key rejected the challenge");
                    return Err(KeytapError::DeviceProtocol(e));
                }
            }
        }
    }

    fn timed_out(&self, ticks: u64) -> KeytapError {
        warn!(ticks, "No touch before the challenge deadline");
        KeytapError::Timeout(self.config.timeout)
    }
}
