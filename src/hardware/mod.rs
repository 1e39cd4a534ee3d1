//! The hardware module contains the byte transports used to reach an OBD adapter.
//!
//! Every adapter link, be it a USB serial cable, a Bluetooth RFCOMM stream or the
//! built in simulator, implements [Transport]. The protocol engine never sees anything
//! else, so a custom link only has to implement this one trait.

use std::{fmt::Debug, sync::Arc, time::Duration};

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
#[cfg(feature = "serial")]
pub mod serial;
pub mod simulation;

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a byte transport
pub enum TransportError {
    /// Underlying IO error
    #[error("IO error: {0}")]
    IOError(#[from] #[source] Arc<std::io::Error>),
    /// Function called on a transport that has not been opened
    #[error("transport '{0}' is not open")]
    NotOpen(String),
    /// The remote end went away (cable pulled, RFCOMM link dropped)
    #[error("transport '{0}' was closed by the remote end")]
    Closed(String),
    /// Device could not be found or opened
    #[error("device '{name}' could not be opened: {desc}")]
    DeviceNotFound {
        /// Device path or name
        name: String,
        /// Driver description of the failure
        desc: String,
    },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

/// Control lines reported by [TransportEvent::PinChanged]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum Pin {
    /// Clear to send
    Cts,
    /// Data set ready
    Dsr,
    /// Carrier detect
    CarrierDetect,
    /// Ring indicator
    Ring,
}

/// Out of band notifications from a transport.
///
/// These are informational only. The command channel never depends on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Framing, parity or driver level error on the line
    LineError(String),
    /// A modem control line changed level
    PinChanged {
        /// Which line changed
        pin: Pin,
        /// New level
        high: bool,
    },
}

/// Callback installed with [Transport::set_event_hook]
pub type TransportEventHook = Box<dyn FnMut(TransportEvent) + Send>;

/// Byte oriented duplex link to an OBD adapter
pub trait Transport: Send + Debug {
    /// Human readable name of the link (device path, RFCOMM node, "simulator")
    fn name(&self) -> &str;

    /// Opens the link. Calling this on an open link is a no-op
    fn open(&mut self) -> TransportResult<()>;

    /// Closes the link. Idempotent
    fn close(&mut self);

    /// Returns true if the link is open
    fn is_open(&self) -> bool;

    /// Writes all bytes to the link
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Reads a single byte, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. A timeout is not an error
    fn read_byte(&mut self, timeout: Duration) -> TransportResult<Option<u8>>;

    /// Drops any bytes received but not yet read
    fn discard_input_buffer(&mut self) -> TransportResult<()>;

    /// Drops any bytes queued but not yet transmitted
    fn discard_output_buffer(&mut self) -> TransportResult<()>;

    /// Installs a callback for out of band notifications.
    /// Transports without such notifications ignore the hook
    fn set_event_hook(&mut self, hook: TransportEventHook) {
        drop(hook)
    }
}

/// Selects and configures the transport the manager connects over
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportConfig {
    /// USB / RS232 serial adapter
    #[cfg(feature = "serial")]
    Serial(serial::SerialSettings),
    /// Bluetooth adapter reached through an RFCOMM device node or virtual COM port
    #[cfg(feature = "bluetooth")]
    Bluetooth(bluetooth::RfcommSettings),
    /// Simulated adapter, no hardware required
    Simulator(simulation::SimulatorSettings),
}

impl TransportConfig {
    /// Creates the (not yet opened) transport described by this config
    pub fn build(&self) -> TransportResult<Box<dyn Transport>> {
        Ok(match self {
            #[cfg(feature = "serial")]
            Self::Serial(settings) => Box::new(serial::SerialTransport::new(settings.clone())),
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(settings) => {
                Box::new(bluetooth::RfcommTransport::new(settings.clone()))
            }
            Self::Simulator(settings) => {
                Box::new(simulation::SimulatedAdapter::new(settings.clone()))
            }
        })
    }
}
