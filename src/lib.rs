#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for reading live data and trouble codes from vehicles through ELM327 class
//! OBD-II adapters
//!
//! ## Layers
//!
//! From the wire up:
//!
//! * [hardware] - Byte transports to the adapter ([hardware::Transport]). Serial port,
//!   Bluetooth RFCOMM, and a simulated adapter for running without a vehicle.
//! * [channel] - The ELM327 command line protocol. Writes one command, collects the reply
//!   up to the `>` prompt, strips the echo. Callers are served one at a time, in order.
//! * [obd2] - SAE J1979 protocol engine. Adapter initialization, PID decoding, DTC
//!   reading and clearing, VIN, supported PID discovery.
//! * [dtc] - Diagnostic trouble code decoding (`[0x01, 0x04]` <-> `P0104`).
//! * [manager] - Connection lifecycle and the high level queries. Start here.
//!
//! ## Logging
//!
//! The crate logs through the [log] facade. Wire traffic is logged at `debug` and `trace`,
//! connection lifecycle at `info`, and query retries at `warn`. No logger is installed.
//!
//! ## Features
//!
//! * `serial` (default) - Serial port transport, using `serialport`
//! * `bluetooth` (default) - Bluetooth RFCOMM transport, on top of `serial`
//! * `serde` - `Serialize`/`Deserialize` for settings and decoded values

pub mod channel;
pub mod dtc;
pub mod hardware;
pub mod manager;
pub mod obd2;

pub use channel::{ChannelError, ChannelResult, Command, RawResponse};
pub use dtc::{DtcCategory, DtcCode, DtcReport, DtcStatus};
pub use hardware::{TransportConfig, TransportError, TransportResult};
pub use manager::{
    ConnectionState, ManagerError, ManagerEvent, ManagerEventHandler, ManagerOptions,
    ManagerResult, ObdManager, VoidHandler,
};
pub use obd2::{ObdValue, ProtocolError, ProtocolResult};
