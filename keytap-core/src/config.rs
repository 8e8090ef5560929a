//! Runtime configuration.
//!
//! Defaults are the protocol constants; environment variables can override
//! them for slow hosts or tests:
//!
//! - `KEYTAP_CHALLENGE_TIMEOUT_SECS` - overall touch deadline
//! - `KEYTAP_POLL_INTERVAL_MS` - delay between authenticate requests
//! - `KEYTAP_OPEN_RETRIES` - device open attempts
//! - `KEYTAP_RETRY_DELAY_MS` - delay between open attempts

use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::device::AcquireConfig;
use crate::error::{KeytapError, Result};
use crate::session::SessionConfig;

pub const ENV_CHALLENGE_TIMEOUT_SECS: &str = "KEYTAP_CHALLENGE_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "KEYTAP_POLL_INTERVAL_MS";
pub const ENV_OPEN_RETRIES: &str = "KEYTAP_OPEN_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "KEYTAP_RETRY_DELAY_MS";

/// Timing for device acquisition and the challenge session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeytapConfig {
    pub session: SessionConfig,
    pub acquire: AcquireConfig,
}

impl KeytapConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_positive::<u64>(&lookup, ENV_CHALLENGE_TIMEOUT_SECS)? {
            config.session.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_positive::<u64>(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.session.poll_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_positive::<u32>(&lookup, ENV_OPEN_RETRIES)? {
            config.acquire.max_attempts = attempts;
        }
        if let Some(ms) = parse_positive::<u64>(&lookup, ENV_RETRY_DELAY_MS)? {
            config.acquire.retry_delay = Duration::from_millis(ms);
        }

        debug!(?config, "Loaded configuration");
        Ok(config)
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let value: T = raw.trim().parse().map_err(|_| {
        KeytapError::Config(format!("{name} must be a positive integer, got {raw:?}"))
    })?;
    if value == T::default() {
        return Err(KeytapError::Config(format!("{name} must be greater than zero")));
    }
    Ok(Some(value))
}
