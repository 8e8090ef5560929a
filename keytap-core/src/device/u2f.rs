//! U2F raw message encoding (FIDO U2F v1.2 raw message formats).
//!
//! Transport independent: builds the client data and the authenticate APDU,
//! and interprets the status word of a response.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{AuthenticateRequest, AuthenticateResponse};
use crate::error::DeviceError;

/// Client data type for sign requests.
pub const CLIENT_DATA_TYPE_AUTHENTICATE: &str = "navigator.id.getAssertion";

/// Authenticate instruction byte.
pub const INS_AUTHENTICATE: u8 = 0x02;

/// Control byte: check user presence and sign.
pub const P1_ENFORCE_USER_PRESENCE: u8 = 0x03;

/// Command completed successfully.
pub const SW_NO_ERROR: u16 = 0x9000;

/// Conditions of use not satisfied, i.e. the key wants a touch.
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

#[derive(Debug, Serialize)]
struct ClientData<'a> {
    typ: &'static str,
    challenge: &'a str,
    origin: &'a str,
    cid_pubkey: &'a str,
}

/// Serialize the client data JSON signed by the key.
pub fn client_data_json(request: &AuthenticateRequest) -> Result<Vec<u8>, DeviceError> {
    let client_data = ClientData {
        typ: CLIENT_DATA_TYPE_AUTHENTICATE,
        challenge: &request.challenge,
        origin: &request.facet,
        cid_pubkey: "",
    };
    serde_json::to_vec(&client_data)
        .map_err(|e| DeviceError::Encoding(format!("Failed to serialize client data: {e}")))
}

/// Encode bytes as web-safe base64 without padding.
pub fn websafe_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode web-safe base64, with or without trailing padding.
pub fn websafe_decode(encoded: &str) -> Result<Vec<u8>, DeviceError> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| DeviceError::Encoding(format!("Invalid web-safe base64: {e}")))
}

/// Build an extended-length authenticate APDU.
///
/// Layout: `CLA INS P1 P2 | 00 Lc_hi Lc_lo | challenge(32) application(32) L kh | 00 00`.
pub fn authenticate_apdu(
    client_data: &[u8],
    app_id: &str,
    key_handle: &[u8],
) -> Result<Vec<u8>, DeviceError> {
    let key_handle_len = u8::try_from(key_handle.len()).map_err(|_| {
        DeviceError::Encoding(format!(
            "Key handle too long: {} bytes (max 255)",
            key_handle.len()
        ))
    })?;

    let mut data = Vec::with_capacity(65 + key_handle.len());
    data.extend_from_slice(&Sha256::digest(client_data));
    data.extend_from_slice(&Sha256::digest(app_id.as_bytes()));
    data.push(key_handle_len);
    data.extend_from_slice(key_handle);

    let lc = data.len() as u16;
    let mut apdu = Vec::with_capacity(data.len() + 9);
    apdu.extend_from_slice(&[0x00, INS_AUTHENTICATE, P1_ENFORCE_USER_PRESENCE, 0x00]);
    apdu.push(0x00);
    apdu.extend_from_slice(&lc.to_be_bytes());
    apdu.extend_from_slice(&data);
    apdu.extend_from_slice(&[0x00, 0x00]);
    Ok(apdu)
}

/// Split a response APDU into its body and checked status word.
pub fn check_status(response: &[u8]) -> Result<&[u8], DeviceError> {
    if response.len() < 2 {
        return Err(DeviceError::Transport(format!(
            "Response too short: {} bytes",
            response.len()
        )));
    }
    let (body, sw) = response.split_at(response.len() - 2);
    match u16::from_be_bytes([sw[0], sw[1]]) {
        SW_NO_ERROR => Ok(body),
        SW_CONDITIONS_NOT_SATISFIED => Err(DeviceError::UserPresenceRequired),
        other => Err(DeviceError::Status(other)),
    }
}

/// Run one authenticate exchange through `transmit`, which sends an APDU
/// and returns the raw response APDU.
pub fn authenticate_with<F>(
    request: &AuthenticateRequest,
    transmit: F,
) -> Result<AuthenticateResponse, DeviceError>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, DeviceError>,
{
    let client_data = client_data_json(request)?;
    let key_handle = websafe_decode(&request.key_handle)?;
    let apdu = authenticate_apdu(&client_data, &request.app_id, &key_handle)?;

    let response = transmit(&apdu)?;
    let signature = check_status(&response)?;

    Ok(AuthenticateResponse {
        client_data: websafe_encode(&client_data),
        signature_data: websafe_encode(signature),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthenticateRequest {
        AuthenticateRequest {
            challenge: "nonce-123".into(),
            facet: "https://example.okta.com".into(),
            app_id: "https://example.okta.com".into(),
            key_handle: websafe_encode(&[0xAB; 64]),
        }
    }

    #[test]
    fn test_client_data_fields() {
        let json = client_data_json(&request()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["typ"], "navigator.id.getAssertion");
        assert_eq!(value["challenge"], "nonce-123");
        assert_eq!(value["origin"], "https://example.okta.com");
        assert_eq!(value["cid_pubkey"], "");
    }

    #[test]
    fn test_websafe_decode_accepts_padding() {
        let bytes = [0xFB, 0xFF, 0x01];
        assert_eq!(websafe_decode("-_8B").unwrap(), bytes);
        assert_eq!(websafe_decode("-_8").unwrap(), vec![0xFB, 0xFF]);
        assert_eq!(websafe_decode("-_8=").unwrap(), vec![0xFB, 0xFF]);
        assert!(websafe_decode("+/8=").is_err());
    }

    #[test]
    fn test_apdu_layout() {
        let key_handle = [0x11; 40];
        let apdu = authenticate_apdu(b"{}", "https://app", &key_handle).unwrap();

        assert_eq!(&apdu[..4], &[0x00, 0x02, 0x03, 0x00]);
        assert_eq!(&apdu[4..7], &[0x00, 0x00, 105]);
        assert_eq!(&apdu[7..39], Sha256::digest(b"{}").as_slice());
        assert_eq!(&apdu[39..71], Sha256::digest(b"https://app").as_slice());
        assert_eq!(apdu[71], 40);
        assert_eq!(&apdu[72..112], &key_handle);
        assert_eq!(&apdu[112..], &[0x00, 0x00]);
    }

    #[test]
    fn test_apdu_rejects_oversized_key_handle() {
        let result = authenticate_apdu(b"{}", "https://app", &[0u8; 256]);
        assert!(matches!(result, Err(DeviceError::Encoding(_))));
    }

    #[test]
    fn test_status_words() {
        assert_eq!(check_status(&[0x01, 0x90, 0x00]).unwrap(), &[0x01]);
        assert_eq!(
            check_status(&[0x69, 0x85]),
            Err(DeviceError::UserPresenceRequired)
        );
        assert_eq!(check_status(&[0x6a, 0x80]), Err(DeviceError::Status(0x6a80)));
        assert!(matches!(
            check_status(&[0x90]),
            Err(DeviceError::Transport(_))
        ));
    }

    #[test]
    fn test_authenticate_with_encodes_response() {
        let response = authenticate_with(&request(), |apdu| {
            assert_eq!(apdu[1], INS_AUTHENTICATE);
            Ok(vec![0x01, 0x00, 0x00, 0x00, 0x07, 0x30, 0x44, 0x90, 0x00])
        })
        .unwrap();

        let client_data = websafe_decode(&response.client_data).unwrap();
        assert_eq!(client_data, client_data_json(&request()).unwrap());
        assert_eq!(
            websafe_decode(&response.signature_data).unwrap(),
            vec![0x01, 0x00, 0x00, 0x00, 0x07, 0x30, 0x44]
        );
    }

    #[test]
    fn test_authenticate_with_surfaces_presence_required() {
        let result = authenticate_with(&request(), |_| Ok(vec![0x69, 0x85]));
        assert_eq!(result, Err(DeviceError::UserPresenceRequired));
    }
}
