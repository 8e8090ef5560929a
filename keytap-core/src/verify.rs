//! FIDO factor handler: turns an identity-provider authentication state into
//! the payload of the next `verify` call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::KeytapConfig;
use crate::device::{acquire_device, DeviceEnumerator};
use crate::error::{KeytapError, Result};
use crate::factor::{supports, FactorDescriptor};
use crate::session::{
    ChallengeParameters, ChallengeSession, SignedAssertion, StderrNotifier, TouchNotifier,
};

/// Action name the caller posts the payload to.
pub const VERIFY_ACTION: &str = "verify";

/// A U2F challenge has been issued and must be signed.
pub const STATUS_MFA_CHALLENGE: &str = "MFA_CHALLENGE";

/// A factor is required but no challenge has been issued yet.
pub const STATUS_MFA_REQUIRED: &str = "MFA_REQUIRED";

/// Authentication state returned by the identity provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthnResponse {
    pub status: String,
    #[serde(default)]
    pub state_token: String,
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<AuthnEmbedded>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthnEmbedded {
    #[serde(default)]
    pub factor: Option<ChallengeFactor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChallengeFactor {
    #[serde(default)]
    pub profile: Option<FactorProfile>,
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<FactorEmbedded>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorProfile {
    pub app_id: Option<String>,
    pub version: Option<String>,
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactorEmbedded {
    #[serde(default)]
    pub challenge: Option<Challenge>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Challenge {
    pub nonce: Option<String>,
}

impl AuthnResponse {
    /// Extract challenge parameters from an `MFA_CHALLENGE` response.
    pub fn challenge_parameters(&self) -> Result<ChallengeParameters> {
        let factor = self
            .embedded
            .as_ref()
            .and_then(|e| e.factor.as_ref())
            .ok_or(KeytapError::MissingField("_embedded.factor"))?;
        let profile = factor
            .profile
            .as_ref()
            .ok_or(KeytapError::MissingField("factor.profile"))?;
        let nonce = factor
            .embedded
            .as_ref()
            .and_then(|e| e.challenge.as_ref())
            .and_then(|c| c.nonce.clone())
            .ok_or(KeytapError::MissingField("challenge.nonce"))?;

        Ok(ChallengeParameters {
            challenge_nonce: nonce,
            app_id: profile
                .app_id
                .clone()
                .ok_or(KeytapError::MissingField("profile.appId"))?,
            version: profile
                .version
                .clone()
                .ok_or(KeytapError::MissingField("profile.version"))?,
            key_handle: profile
                .credential_id
                .clone()
                .ok_or(KeytapError::MissingField("profile.credentialId"))?,
            state_token: self.state_token.clone(),
        })
    }
}

/// Payload sent when a factor is required but not yet challenged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassCodePayload {
    pub state_token: String,
    pub pass_code: String,
}

/// Body of the next `verify` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum VerifyPayload {
    Assertion(SignedAssertion),
    PassCode(PassCodePayload),
}

impl VerifyPayload {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Factor handler for U2F security keys.
pub struct FidoFactor {
    enumerator: Arc<dyn DeviceEnumerator>,
    config: KeytapConfig,
    notifier: Arc<dyn TouchNotifier>,
}

impl FidoFactor {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, config: KeytapConfig) -> Self {
        Self {
            enumerator,
            config,
            notifier: Arc::new(StderrNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TouchNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Capability gate for this handler.
    pub fn supported(&self, descriptor: &FactorDescriptor) -> Result<()> {
        supports(descriptor)
    }

    /// Acquire a key and run one challenge session against it.
    pub async fn challenge(&self, params: ChallengeParameters) -> Result<SignedAssertion> {
        let device = acquire_device(self.enumerator.as_ref(), &self.config.acquire).await?;
        ChallengeSession::new(params)
            .with_device(device)
            .with_config(self.config.session.clone())
            .with_notifier(Arc::clone(&self.notifier))
            .run_challenge()
            .await
    }

    /// Build the payload for the authentication state `authn`.
    #[instrument(level = "info", skip_all, fields(status = %authn.status))]
    pub async fn payload(&self, authn: &AuthnResponse) -> Result<VerifyPayload> {
        match authn.status.as_str() {
            STATUS_MFA_CHALLENGE => {
                let params = authn.challenge_parameters()?;
                debug!(app_id = %params.app_id, version = %params.version, "Challenge issued");
                let assertion = self.challenge(params).await?;
                info!("Signed assertion produced");
                Ok(VerifyPayload::Assertion(assertion))
            }
            STATUS_MFA_REQUIRED => Ok(VerifyPayload::PassCode(PassCodePayload {
                state_token: authn.state_token.clone(),
                pass_code: String::new(),
            })),
            other => Err(KeytapError::UnknownStatus(other.to_string())),
        }
    }

    /// Returns the action name and serialized payload.
    pub async fn verify(&self, authn: &AuthnResponse) -> Result<(&'static str, Vec<u8>)> {
        let payload = self.payload(authn).await?;
        Ok((VERIFY_ACTION, payload.to_json()?))
    }
}
