//! Serial port transport for USB / RS232 ELM327 adapters

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{Pin, Transport, TransportError, TransportEvent, TransportEventHook, TransportResult};

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialSettings {
    /// Port name, EG: `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Baud rate. Genuine ELM327 chips default to 38400, many clones to 9600 or 115200
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 38_400,
        }
    }
}

/// Serial port transport
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    read_timeout: Duration,
    event_hook: Option<TransportEventHook>,
    pins: [Option<bool>; 4],
}

impl Debug for SerialTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SerialTransport")
            .field("settings", &self.settings)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Creates a serial transport. The port is not touched until [Transport::open]
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            read_timeout: Duration::from_millis(100),
            event_hook: None,
            pins: [None; 4],
        }
    }

    fn notify(&mut self, event: TransportEvent) {
        if let Some(hook) = self.event_hook.as_mut() {
            hook(event)
        }
    }

    // Modem lines are only sampled while the line is idle
    fn poll_pins(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        let sampled = [
            port.read_clear_to_send().ok(),
            port.read_data_set_ready().ok(),
            port.read_carrier_detect().ok(),
            port.read_ring_indicator().ok(),
        ];
        let changes = pin_changes(&self.pins, &sampled);
        for (level, new) in self.pins.iter_mut().zip(sampled) {
            *level = new.or(*level);
        }
        for change in changes {
            self.notify(change)
        }
    }

    fn port_mut(&mut self) -> TransportResult<&mut Box<dyn SerialPort>> {
        let name = self.settings.port.clone();
        self.port.as_mut().ok_or(TransportError::NotOpen(name))
    }
}

// Order of the levels sampled by `poll_pins`
const PINS: [Pin; 4] = [Pin::Cts, Pin::Dsr, Pin::CarrierDetect, Pin::Ring];

/// Level changes between two samples of the modem lines. A line unreadable in
/// either sample is skipped
fn pin_changes(old: &[Option<bool>; 4], new: &[Option<bool>; 4]) -> Vec<TransportEvent> {
    PINS.iter()
        .zip(old.iter().zip(new.iter()))
        .filter_map(|(pin, levels)| match levels {
            (Some(o), Some(n)) if o != n => Some(TransportEvent::PinChanged { pin: *pin, high: *n }),
            _ => None,
        })
        .collect()
}

pub(crate) fn open_port(name: &str, baud_rate: u32) -> TransportResult<Box<dyn SerialPort>> {
    serialport::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| TransportError::DeviceNotFound {
            name: name.to_string(),
            desc: e.description,
        })
}

pub(crate) fn convert_serial_error(err: serialport::Error) -> TransportError {
    TransportError::from(std::io::Error::from(err))
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn open(&mut self) -> TransportResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        log::debug!(
            "Opening serial port {} at {} baud",
            self.settings.port,
            self.settings.baud_rate
        );
        let port = open_port(&self.settings.port, self.settings.baud_rate)?;
        self.read_timeout = Duration::from_millis(100);
        self.port = Some(port);
        self.pins = [None; 4];
        self.poll_pins();
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::debug!("Closed serial port {}", self.settings.port);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let port = self.port_mut()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> TransportResult<Option<u8>> {
        let timeout = timeout.max(Duration::from_millis(1));
        let cached_timeout = self.read_timeout;
        let port = self.port_mut()?;
        if cached_timeout != timeout {
            port.set_timeout(timeout).map_err(convert_serial_error)?;
        }
        self.read_timeout = timeout;
        let mut buf = [0u8; 1];
        let res = self.port_mut()?.read(&mut buf);
        match res {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                self.poll_pins();
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::NotConnected => {
                self.notify(TransportEvent::LineError(e.to_string()));
                self.port = None;
                Err(TransportError::Closed(self.settings.port.clone()))
            }
            Err(e) => {
                self.notify(TransportEvent::LineError(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn discard_input_buffer(&mut self) -> TransportResult<()> {
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(convert_serial_error)
    }

    fn discard_output_buffer(&mut self) -> TransportResult<()> {
        self.port_mut()?
            .clear(ClearBuffer::Output)
            .map_err(convert_serial_error)
    }

    fn set_event_hook(&mut self, hook: TransportEventHook) {
        self.event_hook = Some(hook)
    }
}

#[cfg(test)]
mod serial_test {
    use super::*;

    #[test]
    fn pin_level_changes() {
        let first = [Some(true), Some(true), Some(false), Some(false)];
        assert!(pin_changes(&[None; 4], &first).is_empty());
        assert!(pin_changes(&first, &first).is_empty());

        let ringing = [Some(false), Some(true), None, Some(true)];
        assert_eq!(
            pin_changes(&first, &ringing),
            vec![
                TransportEvent::PinChanged { pin: Pin::Cts, high: false },
                TransportEvent::PinChanged { pin: Pin::Ring, high: true },
            ]
        );
    }
}
