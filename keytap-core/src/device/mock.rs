//! Mock security key for testing and dry runs.
//! WARNING: signatures are deterministic hashes, not real U2F signatures!

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::u2f::{client_data_json, websafe_encode};
use super::{
    run_blocking, AuthenticateRequest, AuthenticateResponse, DeviceEnumerator, SecurityKey,
};
use crate::error::DeviceError;

/// How a mock key answers authenticate requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Report "user presence required" this many times, then sign.
    TouchAfter(usize),
    /// Never touched: always report "user presence required".
    NeverTouched,
    /// Fail every authenticate request with this error.
    Fails(DeviceError),
    /// Hold every authenticate request on the async timer for this long,
    /// then report "user presence required".
    Stalls(Duration),
    /// Like `Stalls`, but as a blocking transfer on the blocking pool, the
    /// way the HID transport waits for reports.
    BlocksFor(Duration),
}

/// Call counters shared between a mock key and the test observing it.
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    opens: Arc<AtomicUsize>,
    authenticates: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    enumerations: Arc<AtomicUsize>,
}

impl MockCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn authenticates(&self) -> usize {
        self.authenticates.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

/// Scripted security key.
pub struct MockSecurityKey {
    label: String,
    behavior: MockBehavior,
    open_error: Option<DeviceError>,
    close_error: Option<DeviceError>,
    presence_polls: usize,
    is_open: bool,
    counters: MockCounters,
}

impl MockSecurityKey {
    pub fn new(behavior: MockBehavior) -> Self {
        Self::with_counters(behavior, MockCounters::new())
    }

    pub fn with_counters(behavior: MockBehavior, counters: MockCounters) -> Self {
        Self {
            label: "mock-key".to_string(),
            behavior,
            open_error: None,
            close_error: None,
            presence_polls: 0,
            is_open: false,
            counters,
        }
    }

    /// Make every `open` call fail with `error`.
    pub fn failing_open(mut self, error: DeviceError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Make every `close` call fail with `error`. The key is still released.
    pub fn failing_close(mut self, error: DeviceError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }

    /// Deterministic stand-in for the U2F signature body:
    /// user presence byte, 4-byte counter, SHA-256 of the client data.
    fn fake_signature(&self, client_data: &[u8]) -> Vec<u8> {
        let mut signature = vec![0x01];
        signature.extend_from_slice(&(self.counters.authenticates() as u32).to_be_bytes());
        signature.extend_from_slice(&Sha256::digest(client_data));
        signature
    }
}

#[async_trait]
impl SecurityKey for MockSecurityKey {
    async fn open(&mut self) -> Result<(), DeviceError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }
        self.is_open = true;
        Ok(())
    }

    async fn authenticate(
        &mut self,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse, DeviceError> {
        self.counters.authenticates.fetch_add(1, Ordering::SeqCst);
        if !self.is_open {
            return Err(DeviceError::NotOpen);
        }

        match &self.behavior {
            MockBehavior::Fails(error) => Err(error.clone()),
            MockBehavior::NeverTouched => Err(DeviceError::UserPresenceRequired),
            MockBehavior::Stalls(duration) => {
                tokio::time::sleep(*duration).await;
                Err(DeviceError::UserPresenceRequired)
            }
            MockBehavior::BlocksFor(duration) => {
                let duration = *duration;
                run_blocking(move || std::thread::sleep(duration)).await?;
                Err(DeviceError::UserPresenceRequired)
            }
            MockBehavior::TouchAfter(polls) if self.presence_polls < *polls => {
                self.presence_polls += 1;
                Err(DeviceError::UserPresenceRequired)
            }
            MockBehavior::TouchAfter(_) => {
                let client_data = client_data_json(request)?;
                Ok(AuthenticateResponse {
                    client_data: websafe_encode(&client_data),
                    signature_data: websafe_encode(&self.fake_signature(&client_data)),
                })
            }
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.is_open = false;
        match &self.close_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn description(&self) -> String {
        self.label.clone()
    }
}

type KeyFactory = dyn Fn(usize) -> Result<Vec<Box<dyn SecurityKey>>, DeviceError> + Send + Sync;

/// Enumerator that builds fresh mock keys on every call.
///
/// The factory receives the zero-based enumeration index, so tests can
/// script behavior that changes between retry attempts.
pub struct MockEnumerator {
    factory: Box<KeyFactory>,
    counters: MockCounters,
}

impl MockEnumerator {
    pub fn new<F>(counters: MockCounters, factory: F) -> Self
    where
        F: Fn(usize) -> Result<Vec<Box<dyn SecurityKey>>, DeviceError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            counters,
        }
    }

    /// No keys attached.
    pub fn empty(counters: MockCounters) -> Self {
        Self::new(counters, |_| Ok(Vec::new()))
    }

    /// One working key with the given behavior.
    pub fn single(behavior: MockBehavior, counters: MockCounters) -> Self {
        let key_counters = counters.clone();
        Self::new(counters, move |_| {
            Ok(vec![Box::new(MockSecurityKey::with_counters(
                behavior.clone(),
                key_counters.clone(),
            )) as Box<dyn SecurityKey>])
        })
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn devices(&self) -> Result<Vec<Box<dyn SecurityKey>>, DeviceError> {
        let index = self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        (self.factory)(index)
    }
}
