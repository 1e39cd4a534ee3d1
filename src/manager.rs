//! The connection manager, the crate's main entry point.
//!
//! [ObdManager] owns the transport, command channel and protocol engine for one adapter,
//! tracks the [ConnectionState] and exposes the high level vehicle queries.
//!
//! ```no_run
//! use obd_diagnostics::{
//!     hardware::{TransportConfig, simulation::SimulatorSettings},
//!     manager::{ManagerOptions, ObdManager, VoidHandler},
//! };
//!
//! let manager = ObdManager::new(ManagerOptions::default(), VoidHandler);
//! manager.connect(&TransportConfig::Simulator(SimulatorSettings::default())).unwrap();
//! println!("{}", manager.rpm().unwrap());
//! for code in manager.read_dtcs().unwrap().codes {
//!     println!("{code}");
//! }
//! manager.disconnect();
//! ```

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use strum_macros::EnumIter;

use crate::{
    channel::{ChannelError, ChannelSettings, Command, RawResponse},
    dtc::DtcReport,
    hardware::{Transport, TransportConfig, TransportError, TransportEvent},
    obd2::{DataPid, EngineSettings, ObdEngine, ObdValue, ProtocolError, ProtocolResult},
};

/// Manager result
pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by the manager
pub enum ManagerError {
    /// A query was made without a connected adapter
    #[error("not connected to an adapter")]
    NotConnected,
    /// `connect` was called while connecting or connected
    #[error("already connected, or connecting, to an adapter")]
    AlreadyConnected,
    /// The transport could not be created or opened
    #[error("transport error")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// Protocol or command channel error
    #[error("protocol error")]
    Protocol(
        #[from]
        #[source]
        ProtocolError,
    ),
}

/// Connection state of the manager
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, EnumIter, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No adapter
    #[default]
    Disconnected,
    /// Transport open, adapter initialization running
    Connecting,
    /// Adapter initialized, queries allowed
    Connected,
    /// Initialization failed or the link was lost. Always followed by `Disconnected`
    Error,
}

/// Diagnostic events reported to a [ManagerEventHandler]
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The connection state changed
    StateChanged {
        /// Previous state
        old: ConnectionState,
        /// New state
        new: ConnectionState,
    },
    /// A query is about to be sent
    Request(&'static str),
    /// A query completed
    Response {
        /// Query name
        query: &'static str,
        /// Time taken, including any retry
        elapsed: Duration,
    },
    /// A query failed
    QueryFailed {
        /// Query name
        query: &'static str,
        /// Why
        error: ManagerError,
    },
    /// Out of band notification from the transport
    Transport(TransportEvent),
}

/// Observer for [ManagerEvent]s. Called from whichever thread caused the event, never
/// while the manager holds its state lock or the adapter link. Transport events are
/// queued and delivered once the operation that produced them has finished, so a handler
/// may call back into the manager, including [ObdManager::disconnect]
pub trait ManagerEventHandler: Send + Sync {
    /// Handle an event
    fn on_event(&self, e: ManagerEvent);
}

impl<F: Fn(ManagerEvent) + Send + Sync> ManagerEventHandler for F {
    fn on_event(&self, e: ManagerEvent) {
        self(e)
    }
}

#[derive(Debug, Copy, Clone)]
/// Event handler that ignores everything
pub struct VoidHandler;

impl ManagerEventHandler for VoidHandler {
    fn on_event(&self, _e: ManagerEvent) {}
}

/// Manager configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerOptions {
    /// Command channel timing
    pub channel: ChannelSettings,
    /// Protocol engine settings
    pub engine: EngineSettings,
}

#[derive(Debug, Default)]
struct Session {
    state: ConnectionState,
    engine: Option<Arc<ObdEngine>>,
    // Bumped by every connect attempt
    attempt: u64,
}

/// Connection manager for one OBD adapter. Safe to share between threads
pub struct ObdManager {
    options: ManagerOptions,
    session: Mutex<Session>,
    handler: Arc<dyn ManagerEventHandler>,
    transport_events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl Debug for ObdManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObdManager")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

impl ObdManager {
    /// Creates a disconnected manager
    pub fn new<H: ManagerEventHandler + 'static>(options: ManagerOptions, handler: H) -> Self {
        Self {
            options,
            session: Mutex::new(Session::default()),
            handler: Arc::new(handler),
            transport_events: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, e: ManagerEvent) {
        self.handler.on_event(e)
    }

    fn deliver_transport_events(&self) {
        let events = {
            let mut queued = self.transport_events.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queued)
        };
        for e in events {
            self.emit(ManagerEvent::Transport(e))
        }
    }

    fn emit_change(&self, old: ConnectionState, new: ConnectionState) {
        if old != new {
            log::debug!("Connection state {old} -> {new}");
            self.emit(ManagerEvent::StateChanged { old, new })
        }
    }

    // Sets the state, but only if the session still belongs to `engine`
    fn transition_if(&self, engine: &Arc<ObdEngine>, new: ConnectionState, keep_engine: bool) -> bool {
        let old = {
            let mut s = self.lock();
            if !s.engine.as_ref().is_some_and(|e| Arc::ptr_eq(e, engine)) {
                return false;
            }
            if !keep_engine {
                s.engine = None;
            }
            std::mem::replace(&mut s.state, new)
        };
        self.emit_change(old, new);
        true
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// True when queries can be made
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Manager options
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Adapter identification printed on reset, while connected
    pub fn adapter_version(&self) -> Option<String> {
        self.lock().engine.as_ref().and_then(|e| e.adapter_version())
    }

    /// Builds the transport described by `config`, opens it and initializes the adapter
    pub fn connect(&self, config: &TransportConfig) -> ManagerResult<()> {
        let attempt = self.begin_connect()?;
        match config.build() {
            Ok(transport) => self.finish_connect(transport, attempt),
            Err(e) => Err(self.fail_connect(attempt, None, e.into())),
        }
    }

    /// Connects over a transport built by the caller. The transport is opened if needed
    pub fn connect_transport(&self, transport: Box<dyn Transport>) -> ManagerResult<()> {
        let attempt = self.begin_connect()?;
        self.finish_connect(transport, attempt)
    }

    fn begin_connect(&self) -> ManagerResult<u64> {
        let (old, attempt) = {
            let mut s = self.lock();
            match s.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(ManagerError::AlreadyConnected);
                }
                _ => {
                    s.attempt += 1;
                    (std::mem::replace(&mut s.state, ConnectionState::Connecting), s.attempt)
                }
            }
        };
        self.emit_change(old, ConnectionState::Connecting);
        Ok(attempt)
    }

    // Error -> Disconnected, unless something else took the session over meanwhile
    fn settle_error(&self, attempt: u64) {
        {
            let mut s = self.lock();
            if s.state != ConnectionState::Error || s.attempt != attempt {
                return;
            }
            s.state = ConnectionState::Disconnected;
        }
        self.emit_change(ConnectionState::Error, ConnectionState::Disconnected);
    }

    // Ends a failed connect attempt through Error. An attempt cancelled by
    // `disconnect` reports NotConnected instead of `error`
    fn fail_connect(
        &self,
        attempt: u64,
        engine: Option<&Arc<ObdEngine>>,
        error: ManagerError,
    ) -> ManagerError {
        let owned = match engine {
            Some(e) => self.transition_if(e, ConnectionState::Error, false),
            None => {
                let old = {
                    let mut s = self.lock();
                    if s.state != ConnectionState::Connecting || s.attempt != attempt {
                        return ManagerError::NotConnected;
                    }
                    std::mem::replace(&mut s.state, ConnectionState::Error)
                };
                self.emit_change(old, ConnectionState::Error);
                true
            }
        };
        if let Some(e) = engine {
            e.shutdown();
        }
        if owned {
            self.settle_error(attempt);
            error
        } else {
            ManagerError::NotConnected
        }
    }

    fn finish_connect(&self, mut transport: Box<dyn Transport>, attempt: u64) -> ManagerResult<()> {
        let events = self.transport_events.clone();
        transport.set_event_hook(Box::new(move |ev| {
            events.lock().unwrap_or_else(PoisonError::into_inner).push(ev)
        }));
        log::info!("Connecting to adapter on {}", transport.name());
        if let Err(e) = transport.open() {
            log::info!("Could not open {}: {e}", transport.name());
            self.deliver_transport_events();
            return Err(self.fail_connect(attempt, None, e.into()));
        }

        let engine = Arc::new(ObdEngine::new(transport, self.options.channel, self.options.engine));
        {
            let mut s = self.lock();
            if s.state != ConnectionState::Connecting || s.attempt != attempt {
                // Disconnected while opening
                drop(s);
                engine.shutdown();
                return Err(ManagerError::NotConnected);
            }
            s.engine = Some(engine.clone());
        }

        let init = engine.initialize();
        self.deliver_transport_events();
        if let Err(e) = init {
            log::info!("Adapter initialization failed: {e}");
            return Err(self.fail_connect(attempt, Some(&engine), e.into()));
        }
        if !self.transition_if(&engine, ConnectionState::Connected, true) {
            engine.shutdown();
            return Err(ManagerError::NotConnected);
        }
        log::info!("Connected to {}", engine.adapter_version().unwrap_or_default());
        Ok(())
    }

    /// Closes the transport and returns to `Disconnected`, aborting any command in
    /// flight. Safe to call in any state, any number of times
    pub fn disconnect(&self) {
        let (old, engine) = {
            let mut s = self.lock();
            let engine = s.engine.take();
            (std::mem::replace(&mut s.state, ConnectionState::Disconnected), engine)
        };
        if let Some(engine) = engine {
            engine.shutdown();
            log::info!("Disconnected from adapter");
        }
        self.emit_change(old, ConnectionState::Disconnected);
    }

    fn run<T, F>(&self, query: &'static str, f: F) -> ManagerResult<T>
    where
        F: FnOnce(&ObdEngine) -> ProtocolResult<T>,
    {
        let (engine, attempt) = {
            let s = self.lock();
            match (&s.state, &s.engine) {
                (ConnectionState::Connected, Some(e)) => (e.clone(), s.attempt),
                _ => return Err(ManagerError::NotConnected),
            }
        };
        self.emit(ManagerEvent::Request(query));
        let start = Instant::now();
        let res = f(&engine);
        self.deliver_transport_events();
        match res {
            Ok(v) => {
                self.emit(ManagerEvent::Response {
                    query,
                    elapsed: start.elapsed(),
                });
                Ok(v)
            }
            Err(e) => {
                let link_lost = matches!(
                    e,
                    ProtocolError::Channel(ChannelError::TransportClosed { .. } | ChannelError::Transport(_))
                );
                let error = ManagerError::from(e);
                self.emit(ManagerEvent::QueryFailed {
                    query,
                    error: error.clone(),
                });
                if link_lost && self.transition_if(&engine, ConnectionState::Error, false) {
                    log::info!("Adapter link lost during '{query}'");
                    engine.shutdown();
                    self.settle_error(attempt);
                }
                Err(error)
            }
        }
    }

    /// Engine speed (rpm)
    pub fn rpm(&self) -> ManagerResult<ObdValue> {
        self.run("rpm", |e| e.read_pid(DataPid::EngineSpeed))
    }

    /// Vehicle speed (km/h)
    pub fn speed(&self) -> ManagerResult<ObdValue> {
        self.run("speed", |e| e.read_pid(DataPid::VehicleSpeed))
    }

    /// Engine coolant temperature (°C)
    pub fn coolant_temp(&self) -> ManagerResult<ObdValue> {
        self.run("coolant_temp", |e| e.read_pid(DataPid::EngineCoolantTemp))
    }

    /// Calculated engine load (%)
    pub fn engine_load(&self) -> ManagerResult<ObdValue> {
        self.run("engine_load", |e| e.read_pid(DataPid::CalculatedEngineLoad))
    }

    /// Supply voltage measured by the adapter (V)
    pub fn battery_voltage(&self) -> ManagerResult<ObdValue> {
        self.run("battery_voltage", |e| e.battery_voltage())
    }

    /// Any service 01 PID. PIDs without a known formula come back as [ObdValue::RawBytes]
    pub fn query_pid(&self, pid: u8) -> ManagerResult<ObdValue> {
        self.run("query_pid", |e| e.read_pid(DataPid::from(pid)))
    }

    /// Service 01 PIDs supported by the vehicle
    pub fn supported_pids(&self) -> ManagerResult<Vec<u8>> {
        self.run("supported_pids", |e| e.supported_pids())
    }

    /// MIL state and stored DTCs
    pub fn read_dtcs(&self) -> ManagerResult<DtcReport> {
        self.run("read_dtcs", |e| e.read_dtcs())
    }

    /// Clears stored DTCs. Never retried
    pub fn clear_dtcs(&self) -> ManagerResult<()> {
        self.run("clear_dtcs", |e| e.clear_dtcs())
    }

    /// Vehicle identification number
    pub fn vin(&self) -> ManagerResult<String> {
        self.run("vin", |e| e.vin())
    }

    /// Sends a command verbatim and returns the unparsed reply
    pub fn send_raw(&self, cmd: &Command) -> ManagerResult<RawResponse> {
        self.run("send_raw", |e| e.send_raw(cmd))
    }
}

impl Drop for ObdManager {
    fn drop(&mut self) {
        self.disconnect()
    }
}
