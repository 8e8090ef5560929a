//! Exit codes following sysexits.h conventions.
//!
//! Scripts wrapping `keytap` can tell a missing key apart from a user who
//! never touched it, and both apart from a malformed input document.

use keytap_core::KeytapError;

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// General error (catch-all, including device protocol failures).
pub const GENERAL_ERROR: i32 = 1;

/// Unsupported factor, unknown status or malformed document.
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Cannot open input file.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// No security key attached, or none could be opened.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const DEVICE_UNAVAILABLE: i32 = 69;

/// The key was never touched before the deadline.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TIMEOUT: i32 = 75;

/// Represents an exit code with optional error context.
#[derive(Debug)]
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = match status_hint(err) {
            Some(hint) => format!("{err:#} ({hint})"),
            None => format!("{err:#}"),
        };
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<KeytapError>() {
                    Some(code_for(e))
                } else if cause.downcast_ref::<std::io::Error>().is_some() {
                    Some(INPUT_ERROR)
                } else if cause.downcast_ref::<serde_json::Error>().is_some() {
                    Some(DATA_ERROR)
                } else {
                    None
                }
            })
            .unwrap_or(GENERAL_ERROR);

        Self {
            code,
            message: Some(message),
        }
    }
}

/// Name of the U2F status word behind a device protocol failure, if known.
fn status_hint(err: &anyhow::Error) -> Option<&'static str> {
    err.chain().find_map(|cause| match cause.downcast_ref::<KeytapError>() {
        Some(KeytapError::DeviceProtocol(device_err)) => device_err.status_name(),
        _ => None,
    })
}

fn code_for(err: &KeytapError) -> i32 {
    match err {
        KeytapError::Unsupported(_)
        | KeytapError::UnknownStatus(_)
        | KeytapError::MissingField(_)
        | KeytapError::Serialization(_) => DATA_ERROR,
        KeytapError::NoDeviceFound | KeytapError::OpenExhausted { .. } => DEVICE_UNAVAILABLE,
        KeytapError::Timeout(_) => TIMEOUT,
        KeytapError::DeviceProtocol(_) | KeytapError::NoDeviceHandle | KeytapError::Config(_) => {
            GENERAL_ERROR
        }
    }
}
