//! Keytap Core - touch-confirmed U2F/FIDO second-factor authentication
//!
//! This crate answers an identity provider's U2F challenge with a hardware
//! security key: it decides whether a factor is a U2F factor, finds and opens
//! an attached key, then polls it until the user touches it and a signed
//! assertion comes back.
//!
//! # Features
//!
//! - Capability gate for `u2f`/`FIDO` factors
//! - Bounded open retries (10 attempts, 200ms apart)
//! - 25 second challenge deadline with a 250ms poll tick
//! - Device always released, including on cancellation
//! - USB HID transport behind the `hid` feature, plus a scripted mock key
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keytap_core::{AuthnResponse, FidoFactor, HidEnumerator, KeytapConfig};
//!
//! # async fn example(authn: AuthnResponse) -> keytap_core::Result<()> {
//! let factor = FidoFactor::new(Arc::new(HidEnumerator::new()), KeytapConfig::from_env()?);
//!
//! // Prompts on stderr once the key asks for a touch
//! let (action, payload) = factor.verify(&authn).await?;
//! assert_eq!(action, "verify");
//! println!("{}", String::from_utf8_lossy(&payload));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod factor;
pub mod session;
pub mod verify;

// Re-export main types for convenience
pub use config::KeytapConfig;
pub use device::{
    acquire_device, AcquireConfig, AuthenticateRequest, AuthenticateResponse, DeviceEnumerator,
    DeviceOpenOutcome, MockBehavior, MockCounters, MockEnumerator, MockSecurityKey, SecurityKey,
};
#[cfg(feature = "hid")]
pub use device::{DeviceSummary, HidEnumerator};
pub use error::{DeviceError, KeytapError, Result};
pub use factor::{supports, FactorDescriptor, FACTOR_TYPE_U2F, PROVIDER_FIDO};
pub use session::{
    ChallengeParameters, ChallengeSession, SessionConfig, SignedAssertion, StderrNotifier,
    TouchNotifier, CHALLENGE_TIMEOUT, POLL_INTERVAL,
};
pub use verify::{AuthnResponse, FidoFactor, VerifyPayload, VERIFY_ACTION};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Integration test: gate the factor, acquire the key, sign the challenge.
    #[tokio::test(start_paused = true)]
    async fn test_full_challenge_workflow() {
        // Step 1: Capability gate
        let descriptor = FactorDescriptor::new("u2f", "FIDO");
        supports(&descriptor).expect("u2f/FIDO must be supported");

        // Step 2: Key that needs three presence polls before signing
        let counters = MockCounters::new();
        let enumerator = MockEnumerator::single(MockBehavior::TouchAfter(3), counters.clone());
        let device = acquire_device(&enumerator, &AcquireConfig::default())
            .await
            .expect("Failed to acquire device");

        // Step 3: Run the session
        let params = ChallengeParameters {
            challenge_nonce: "nonce-123".into(),
            app_id: "https://login.example.com".into(),
            version: "U2F_V2".into(),
            key_handle: "a2V5LWhhbmRsZQ".into(),
            state_token: "state-xyz".into(),
        };
        let assertion = ChallengeSession::new(params)
            .with_device(device)
            .run_challenge()
            .await
            .expect("Challenge failed");

        assert_eq!(assertion.state_token, "state-xyz");
        assert!(!assertion.client_data.is_empty());
        assert!(!assertion.signature_data.is_empty());
        assert_eq!(counters.authenticates(), 4);
        assert_eq!(counters.closes(), 1);
    }
}
