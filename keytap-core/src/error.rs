use std::time::Duration;

use thiserror::Error;

/// Errors raised by a security key while it is being driven.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The key is waiting for a physical touch. Not a failure while polling.
    #[error("test of user presence required")]
    UserPresenceRequired,

    #[error("device returned status word 0x{0:04x}")]
    Status(u16),

    #[error("U2FHID transport error: {0}")]
    Transport(String),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("device is not open")]
    NotOpen,
}

impl DeviceError {
    /// Human-readable name for a well-known U2F status word.
    pub fn status_name(&self) -> Option<&'static str> {
        match self {
            Self::Status(0x6a80) => Some("wrong data (key handle not recognised)"),
            Self::Status(0x6700) => Some("wrong length"),
            Self::Status(0x6d00) => Some("instruction not supported"),
            Self::Status(0x6e00) => Some("class not supported"),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum KeytapError {
    #[error("fido doesn't support factor type {0:?}")]
    Unsupported(String),

    #[error("no U2F devices found. device might not be plugged in")]
    NoDeviceFound,

    #[error("failed to open U2F device: {cause}. exceeded max retries of {retries}")]
    OpenExhausted { cause: DeviceError, retries: u32 },

    #[error("U2F device error: {0}")]
    DeviceProtocol(DeviceError),

    #[error("failed to get authentication response after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("no device handle: challenge session run without an acquired device")]
    NoDeviceHandle,

    #[error("unknown authentication status: {0}")]
    UnknownStatus(String),

    #[error("authentication response is missing {0}")]
    MissingField(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeytapError {
    /// Whether the caller should try another factor handler instead of failing.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, KeytapError>;
