//! Security key devices.
//!
//! All hardware access goes through the [`SecurityKey`] trait so the
//! acquisition retry loop and the challenge poll loop can be driven by
//! either a real USB key or the deterministic [`MockSecurityKey`].
//!
//! ## Transports
//!
//! - **USB HID** ([`HidSecurityKey`]) - U2FHID framing over `hidapi`
//! - **Mock** ([`MockSecurityKey`]) - scripted key for tests and dry runs

pub mod acquire;
#[cfg(feature = "hid")]
mod hid;
mod mock;
pub mod u2f;

pub use acquire::{acquire_device, open_first, AcquireConfig, MAX_OPEN_RETRIES, RETRY_DELAY};
#[cfg(feature = "hid")]
pub use hid::{DeviceSummary, HidEnumerator, HidSecurityKey};
pub use mock::{MockBehavior, MockCounters, MockEnumerator, MockSecurityKey};

use async_trait::async_trait;

use crate::error::DeviceError;

/// One authenticate (sign) request sent to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateRequest {
    /// Challenge nonce issued by the identity provider.
    pub challenge: String,
    /// Origin placed in the client data. The app id is the only facet.
    pub facet: String,
    pub app_id: String,
    /// Web-safe base64 key handle (credential id).
    pub key_handle: String,
}

/// A successful authenticate response, both fields web-safe base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub client_data: String,
    pub signature_data: String,
}

/// Capability set of a physical authenticator.
///
/// A key is exclusively owned by whoever holds the box; no implementation
/// needs to support concurrent calls.
#[async_trait]
pub trait SecurityKey: Send {
    /// Open the device and prepare it for requests.
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Issue a single authenticate request.
    ///
    /// Returns [`DeviceError::UserPresenceRequired`] while the key waits for
    /// a touch. Implementations must bound the time spent in this call and
    /// keep blocking I/O off the async workers (see [`run_blocking`]).
    async fn authenticate(
        &mut self,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse, DeviceError>;

    /// Release the device. Closing an already closed key is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Short label for logs.
    fn description(&self) -> String;
}

/// Lists the keys currently attached to the machine.
pub trait DeviceEnumerator: Send + Sync {
    /// Returns unopened handles, in the order they should be tried.
    fn devices(&self) -> Result<Vec<Box<dyn SecurityKey>>, DeviceError>;
}

/// Run blocking transport work on tokio's blocking pool.
///
/// The caller's future stays cancellable: if it is dropped, the work runs to
/// completion in the background and its result is discarded.
pub async fn run_blocking<T, F>(work: F) -> Result<T, DeviceError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DeviceError::Transport(format!("Device worker failed: {e}")))
}

/// Result of one attempt to enumerate and open a key.
pub enum DeviceOpenOutcome {
    Opened(Box<dyn SecurityKey>),
    /// Enumeration returned no devices at all.
    NotPresent,
    /// Devices exist but none could be opened; carries the last cause.
    TransientFailure(DeviceError),
}

impl std::fmt::Debug for DeviceOpenOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened(device) => write!(f, "Opened({})", device.description()),
            Self::NotPresent => write!(f, "NotPresent"),
            Self::TransientFailure(cause) => write!(f, "TransientFailure({cause})"),
        }
    }
}
