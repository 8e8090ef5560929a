//! USB HID transport for U2F security keys (FIDO U2F HID protocol).
//!
//! Messages are split into 64-byte reports: one initialization packet
//! followed by continuation packets. Every read is bounded by
//! [`FRAME_TIMEOUT_MS`] so a key that stops answering cannot stall the
//! challenge poll loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hidapi::{DeviceInfo, HidApi, HidDevice};
use rand::RngCore;
use tracing::{debug, instrument, warn};

use super::u2f::authenticate_with;
use super::{
    run_blocking, AuthenticateRequest, AuthenticateResponse, DeviceEnumerator, SecurityKey,
};
use crate::error::DeviceError;

/// FIDO alliance HID usage page.
const FIDO_USAGE_PAGE: u16 = 0xF1D0;

/// U2FHID usage for the top-level collection.
const FIDO_USAGE_U2FHID: u16 = 0x01;

const HID_RPT_SIZE: usize = 64;
const INIT_DATA_SIZE: usize = HID_RPT_SIZE - 7;
const CONT_DATA_SIZE: usize = HID_RPT_SIZE - 5;
const MAX_MESSAGE_SIZE: usize = INIT_DATA_SIZE + 128 * CONT_DATA_SIZE;

const CID_BROADCAST: [u8; 4] = [0xFF; 4];
const TYPE_INIT: u8 = 0x80;

const U2FHID_MSG: u8 = TYPE_INIT | 0x03;
const U2FHID_INIT: u8 = TYPE_INIT | 0x06;
const U2FHID_KEEPALIVE: u8 = TYPE_INIT | 0x3B;
const U2FHID_ERROR: u8 = TYPE_INIT | 0x3F;

const INIT_NONCE_SIZE: usize = 8;

/// Maximum wait for a single report.
pub const FRAME_TIMEOUT_MS: i32 = 500;

/// Maximum wait for a complete response message.
const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Split a message into HID reports for channel `cid`.
fn frame_message(
    cid: [u8; 4],
    cmd: u8,
    payload: &[u8],
) -> Result<Vec<[u8; HID_RPT_SIZE]>, DeviceError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(DeviceError::Transport(format!(
            "Message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            payload.len()
        )));
    }

    let mut frames = Vec::new();
    let first_len = payload.len().min(INIT_DATA_SIZE);

    let mut init = [0u8; HID_RPT_SIZE];
    init[..4].copy_from_slice(&cid);
    init[4] = cmd;
    init[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    init[7..7 + first_len].copy_from_slice(&payload[..first_len]);
    frames.push(init);

    for (seq, chunk) in payload[first_len..].chunks(CONT_DATA_SIZE).enumerate() {
        let mut cont = [0u8; HID_RPT_SIZE];
        cont[..4].copy_from_slice(&cid);
        cont[4] = seq as u8;
        cont[5..5 + chunk.len()].copy_from_slice(chunk);
        frames.push(cont);
    }

    Ok(frames)
}

/// Reassembles one response message from incoming reports.
#[derive(Debug)]
struct Reassembler {
    cid: [u8; 4],
    cmd: Option<u8>,
    expected: usize,
    next_seq: u8,
    data: Vec<u8>,
}

impl Reassembler {
    fn new(cid: [u8; 4]) -> Self {
        Self {
            cid,
            cmd: None,
            expected: 0,
            next_seq: 0,
            data: Vec::new(),
        }
    }

    /// Feed a report. Returns the command and payload once complete.
    fn push(&mut self, frame: &[u8]) -> Result<Option<(u8, Vec<u8>)>, DeviceError> {
        if frame.len() < 5 || frame[..4] != self.cid {
            // Traffic for another channel.
            return Ok(None);
        }

        match self.cmd {
            None => {
                if frame[4] & TYPE_INIT == 0 {
                    return Err(DeviceError::Transport(
                        "Expected initialization packet".into(),
                    ));
                }
                if frame[4] == U2FHID_KEEPALIVE {
                    return Ok(None);
                }
                if frame.len() < 7 {
                    return Err(DeviceError::Transport("Truncated initialization packet".into()));
                }
                self.cmd = Some(frame[4]);
                self.expected = u16::from_be_bytes([frame[5], frame[6]]) as usize;
                let take = self.expected.min(frame.len() - 7);
                self.data.extend_from_slice(&frame[7..7 + take]);
            }
            Some(_) => {
                if frame[4] != self.next_seq {
                    return Err(DeviceError::Transport(format!(
                        "Continuation packet out of order: expected {}, got {}",
                        self.next_seq, frame[4]
                    )));
                }
                self.next_seq = self.next_seq.wrapping_add(1);
                let take = (self.expected - self.data.len()).min(frame.len() - 5);
                self.data.extend_from_slice(&frame[5..5 + take]);
            }
        }

        match self.cmd {
            Some(cmd) if self.data.len() >= self.expected => {
                Ok(Some((cmd, std::mem::take(&mut self.data))))
            }
            _ => Ok(None),
        }
    }
}

/// Identifying details of an attached FIDO HID interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceSummary {
    fn from_info(info: &DeviceInfo) -> Self {
        Self {
            path: info.path().to_string_lossy().into_owned(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            manufacturer: info.manufacturer_string().map(str::to_string),
            product: info.product_string().map(str::to_string),
        }
    }
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} {}",
            self.vendor_id,
            self.product_id,
            self.manufacturer.as_deref().unwrap_or("unknown"),
            self.product.as_deref().unwrap_or("security key")
        )
    }
}

/// Enumerates U2F keys through the system HID stack.
#[derive(Debug, Default)]
pub struct HidEnumerator;

impl HidEnumerator {
    pub fn new() -> Self {
        Self
    }

    fn api() -> Result<HidApi, DeviceError> {
        HidApi::new().map_err(|e| DeviceError::Hid(format!("Failed to initialise HID API: {e}")))
    }

    fn is_fido(info: &DeviceInfo) -> bool {
        info.usage_page() == FIDO_USAGE_PAGE && info.usage() == FIDO_USAGE_U2FHID
    }

    /// Describe every attached FIDO interface without opening it.
    pub fn list(&self) -> Result<Vec<DeviceSummary>, DeviceError> {
        let api = Self::api()?;
        Ok(api
            .device_list()
            .filter(|info| Self::is_fido(info))
            .map(DeviceSummary::from_info)
            .collect())
    }
}

impl DeviceEnumerator for HidEnumerator {
    fn devices(&self) -> Result<Vec<Box<dyn SecurityKey>>, DeviceError> {
        let api = Arc::new(Self::api()?);
        let devices: Vec<Box<dyn SecurityKey>> = api
            .device_list()
            .filter(|info| Self::is_fido(info))
            .map(|info| {
                let key = HidSecurityKey::new(Arc::clone(&api), info.clone());
                Box::new(key) as Box<dyn SecurityKey>
            })
            .collect();
        debug!(count = devices.len(), "Enumerated FIDO HID devices");
        Ok(devices)
    }
}

/// An opened HID handle bound to its U2FHID channel.
///
/// All methods block; they run on the blocking pool via [`run_blocking`].
struct HidChannel {
    device: HidDevice,
    cid: [u8; 4],
}

impl HidChannel {
    fn new(device: HidDevice) -> Self {
        Self {
            device,
            cid: CID_BROADCAST,
        }
    }

    fn write_frames(&self, cmd: u8, payload: &[u8]) -> Result<(), DeviceError> {
        for frame in frame_message(self.cid, cmd, payload)? {
            // Leading zero is the HID report number.
            let mut report = [0u8; HID_RPT_SIZE + 1];
            report[1..].copy_from_slice(&frame);
            self.device
                .write(&report)
                .map_err(|e| DeviceError::Hid(format!("HID write failed: {e}")))?;
        }
        Ok(())
    }

    fn read_message(&self) -> Result<(u8, Vec<u8>), DeviceError> {
        let deadline = Instant::now() + TRANSACTION_TIMEOUT;
        let mut reassembler = Reassembler::new(self.cid);
        let mut buf = [0u8; HID_RPT_SIZE];

        loop {
            if Instant::now() >= deadline {
                return Err(DeviceError::Transport("Timed out waiting for response".into()));
            }
            let read = self
                .device
                .read_timeout(&mut buf, FRAME_TIMEOUT_MS)
                .map_err(|e| DeviceError::Hid(format!("HID read failed: {e}")))?;
            if read == 0 {
                continue;
            }
            if let Some(message) = reassembler.push(&buf[..read])? {
                return Ok(message);
            }
        }
    }

    fn transact(&self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.write_frames(cmd, payload)?;
        let (reply_cmd, data) = self.read_message()?;
        match reply_cmd {
            c if c == cmd => Ok(data),
            U2FHID_ERROR => Err(DeviceError::Transport(format!(
                "U2FHID error code 0x{:02x}",
                data.first().copied().unwrap_or(0)
            ))),
            other => Err(DeviceError::Transport(format!(
                "Unexpected U2FHID reply command 0x{other:02x}"
            ))),
        }
    }

    /// Allocate a channel id with a U2FHID_INIT exchange on the broadcast channel.
    fn init(&mut self) -> Result<(), DeviceError> {
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        self.cid = CID_BROADCAST;
        let reply = self.transact(U2FHID_INIT, &nonce)?;
        if reply.len() < INIT_NONCE_SIZE + 4 || reply[..INIT_NONCE_SIZE] != nonce {
            return Err(DeviceError::Transport("U2FHID_INIT nonce mismatch".into()));
        }

        let mut cid = [0u8; 4];
        cid.copy_from_slice(&reply[INIT_NONCE_SIZE..INIT_NONCE_SIZE + 4]);
        self.cid = cid;
        debug!(cid = %hex::encode(cid), "Allocated U2FHID channel");
        Ok(())
    }
}

/// A U2F key reached over USB HID.
///
/// The channel is moved into each blocking transaction and handed back when
/// it completes. If the caller gives up mid-transaction the channel never
/// comes back, and the handle is released when the transaction finishes.
pub struct HidSecurityKey {
    api: Arc<HidApi>,
    info: DeviceInfo,
    channel: Option<HidChannel>,
}

impl HidSecurityKey {
    fn new(api: Arc<HidApi>, info: DeviceInfo) -> Self {
        Self {
            api,
            info,
            channel: None,
        }
    }
}

#[async_trait]
impl SecurityKey for HidSecurityKey {
    #[instrument(level = "debug", skip(self), fields(device = %self.description()))]
    async fn open(&mut self) -> Result<(), DeviceError> {
        let device = self
            .info
            .open_device(&self.api)
            .map_err(|e| DeviceError::Hid(format!("Failed to open device: {e}")))?;

        let mut channel = HidChannel::new(device);
        let (channel, result) = run_blocking(move || {
            let result = channel.init();
            (channel, result)
        })
        .await?;
        result?;

        self.channel = Some(channel);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse, DeviceError> {
        let channel = self.channel.take().ok_or(DeviceError::NotOpen)?;
        let request = request.clone();
        let (channel, result) = run_blocking(move || {
            let result = authenticate_with(&request, |apdu| channel.transact(U2FHID_MSG, apdu));
            (channel, result)
        })
        .await?;

        self.channel = Some(channel);
        result
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.channel.take().is_some() {
            debug!(device = %self.description(), "Closed HID device");
        }
        Ok(())
    }

    fn description(&self) -> String {
        DeviceSummary::from_info(&self.info).to_string()
    }
}

impl Drop for HidSecurityKey {
    fn drop(&mut self) {
        if self.channel.is_some() {
            warn!(device = %self.description(), "HID device dropped while open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    #[test]
    fn test_short_message_fits_one_frame() {
        let frames = frame_message(CID, U2FHID_MSG, &[0xAA; 10]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..4], &CID);
        assert_eq!(frames[0][4], U2FHID_MSG);
        assert_eq!(&frames[0][5..7], &[0x00, 10]);
        assert_eq!(&frames[0][7..17], &[0xAA; 10]);
        assert!(frames[0][17..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_long_message_uses_continuation_frames() {
        let payload: Vec<u8> = (0..200u8).collect();
        let frames = frame_message(CID, U2FHID_MSG, &payload).unwrap();

        // 57 + 59 + 59 + 25
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[0][5..7], &[0x00, 200]);
        assert_eq!(frames[1][4], 0);
        assert_eq!(frames[2][4], 1);
        assert_eq!(frames[3][4], 2);
        assert_eq!(frames[1][5], 57);
    }

    #[test]
    fn test_rejects_oversized_message() {
        let payload = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            frame_message(CID, U2FHID_MSG, &payload),
            Err(DeviceError::Transport(_))
        ));
    }

    #[test]
    fn test_reassembles_framed_reply() {
        let payload: Vec<u8> = (0..150u8).collect();
        let frames = frame_message(CID, U2FHID_MSG, &payload).unwrap();

        let mut reassembler = Reassembler::new(CID);
        let mut result = None;
        for frame in &frames {
            result = reassembler.push(frame).unwrap();
        }
        assert_eq!(result, Some((U2FHID_MSG, payload)));
    }

    #[test]
    fn test_reassembler_ignores_other_channels_and_keepalive() {
        let mut reassembler = Reassembler::new(CID);

        let other = frame_message([9, 9, 9, 9], U2FHID_MSG, &[1, 2, 3]).unwrap();
        assert_eq!(reassembler.push(&other[0]).unwrap(), None);

        let keepalive = frame_message(CID, U2FHID_KEEPALIVE, &[0x02]).unwrap();
        assert_eq!(reassembler.push(&keepalive[0]).unwrap(), None);

        let reply = frame_message(CID, U2FHID_MSG, &[0x69, 0x85]).unwrap();
        assert_eq!(
            reassembler.push(&reply[0]).unwrap(),
            Some((U2FHID_MSG, vec![0x69, 0x85]))
        );
    }

    #[test]
    fn test_reassembler_rejects_out_of_order_continuation() {
        let payload = vec![0x55; 100];
        let frames = frame_message(CID, U2FHID_MSG, &payload).unwrap();
        let mut bad = frames[1];
        bad[4] = 3;

        let mut reassembler = Reassembler::new(CID);
        reassembler.push(&frames[0]).unwrap();
        assert!(matches!(
            reassembler.push(&bad),
            Err(DeviceError::Transport(_))
        ));
    }

    #[test]
    fn test_summary_display() {
        let summary = DeviceSummary {
            path: "/dev/hidraw3".into(),
            vendor_id: 0x1050,
            product_id: 0x0407,
            manufacturer: Some("Yubico".into()),
            product: None,
        };
        assert_eq!(summary.to_string(), "1050:0407 Yubico security key");
    }
}
