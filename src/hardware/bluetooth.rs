//! Bluetooth transport for ELM327 adapters using the serial port profile.
//!
//! The host stack exposes an RFCOMM channel as a character device
//! (`rfcomm bind` creates `/dev/rfcommN` on Linux, Windows creates an outgoing virtual COM
//! port). The baud rate of such a device is meaningless, but the link is slow to come up
//! and may drop when the adapter powers down with the ignition.

use std::time::Duration;

use super::{
    Transport, TransportError, TransportEventHook, TransportResult,
    serial::{SerialSettings, SerialTransport},
};

/// RFCOMM link configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RfcommSettings {
    /// Device node or COM port bound to the adapter's RFCOMM channel
    pub device: String,
    /// Adapter address, for logging only (EG: `00:1D:A5:68:98:8B`)
    pub address: Option<String>,
    /// Number of open attempts before giving up. The first RFCOMM connect
    /// after pairing frequently fails
    pub connect_attempts: u32,
    /// Delay between open attempts
    pub retry_delay: Duration,
}

impl Default for RfcommSettings {
    fn default() -> Self {
        Self {
            device: "/dev/rfcomm0".into(),
            address: None,
            connect_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Bluetooth RFCOMM transport
#[derive(Debug)]
pub struct RfcommTransport {
    settings: RfcommSettings,
    inner: SerialTransport,
}

impl RfcommTransport {
    /// Creates a RFCOMM transport. Nothing is connected until [Transport::open]
    pub fn new(settings: RfcommSettings) -> Self {
        let inner = SerialTransport::new(SerialSettings {
            port: settings.device.clone(),
            baud_rate: 115_200,
        });
        Self { settings, inner }
    }
}

impl Transport for RfcommTransport {
    fn name(&self) -> &str {
        &self.settings.device
    }

    fn open(&mut self) -> TransportResult<()> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.inner.open() {
                Ok(()) => {
                    log::debug!(
                        "RFCOMM link to {} up on attempt {attempt}",
                        self.settings.address.as_deref().unwrap_or(&self.settings.device)
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("RFCOMM open attempt {attempt}/{attempts} failed: {e}");
                    last_err = Some(e);
                    if attempt != attempts {
                        std::thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::NotOpen(self.settings.device.clone())))
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        self.inner.write(bytes)
    }

    fn read_byte(&mut self, timeout: Duration) -> TransportResult<Option<u8>> {
        self.inner.read_byte(timeout)
    }

    fn discard_input_buffer(&mut self) -> TransportResult<()> {
        self.inner.discard_input_buffer()
    }

    fn discard_output_buffer(&mut self) -> TransportResult<()> {
        self.inner.discard_output_buffer()
    }

    fn set_event_hook(&mut self, hook: TransportEventHook) {
        self.inner.set_event_hook(hook)
    }
}
