//! Capability gate: decides whether this client handles a given MFA factor.

use serde::Deserialize;

use crate::error::{KeytapError, Result};

/// Factor type advertised by the identity provider for U2F keys.
pub const FACTOR_TYPE_U2F: &str = "u2f";

/// Provider name advertised for FIDO security keys.
pub const PROVIDER_FIDO: &str = "FIDO";

/// An MFA factor as described by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorDescriptor {
    pub factor_type: String,
    pub provider: String,
}

impl FactorDescriptor {
    pub fn new(factor_type: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            factor_type: factor_type.into(),
            provider: provider.into(),
        }
    }
}

/// Succeeds only for `{u2f, FIDO}` factors.
///
/// Any other pair fails with [`KeytapError::Unsupported`], which callers
/// treat as "try the next factor handler". Comparison is exact, matching the
/// casing the identity provider sends.
pub fn supports(descriptor: &FactorDescriptor) -> Result<()> {
    if descriptor.factor_type == FACTOR_TYPE_U2F && descriptor.provider == PROVIDER_FIDO {
        Ok(())
    } else {
        Err(KeytapError::Unsupported(descriptor.factor_type.clone()))
    }
}
