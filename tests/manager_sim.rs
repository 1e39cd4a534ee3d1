use std::{
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use obd_diagnostics::{
    ChannelError, Command, ConnectionState, DtcCode, ManagerError, ManagerEvent, ManagerOptions,
    ObdManager, ObdValue, ProtocolError, TransportConfig, TransportError, VoidHandler,
    channel::ChannelSettings,
    hardware::{
        Transport, TransportEvent,
        simulation::{SimulatedAdapter, SimulatorSettings},
    },
    obd2::{EngineSettings, InitStep},
};

fn options() -> ManagerOptions {
    ManagerOptions {
        channel: ChannelSettings {
            read_timeout: Duration::from_millis(100),
            max_response_time: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(5),
        },
        engine: EngineSettings {
            reset_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ManagerEvent>>>);

impl Recorder {
    fn states(&self) -> Vec<ConnectionState> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ManagerEvent::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }

    fn handler(&self) -> impl Fn(ManagerEvent) + Send + Sync + 'static {
        let events = self.0.clone();
        move |e| events.lock().unwrap().push(e)
    }
}

fn connected() -> (ObdManager, SimulatedAdapter, Recorder) {
    let _ = env_logger::try_init();
    let recorder = Recorder::default();
    let manager = ObdManager::new(options(), recorder.handler());
    let sim = SimulatedAdapter::default();
    manager.connect_transport(Box::new(sim.clone())).unwrap();
    sim.clear_log();
    (manager, sim, recorder)
}

#[test]
fn connect_and_query() {
    let (manager, sim, recorder) = connected();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.adapter_version().as_deref(), Some("ELM327 v1.5"));
    assert_eq!(
        recorder.states(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    sim.update_vehicle(|v| {
        v.rpm = 1726.0;
        v.speed_kmh = 60;
        v.coolant_temp_c = 83;
        v.engine_load = 100.0;
    });
    assert_eq!(manager.rpm().unwrap(), ObdValue::EngineRpm(1726.0));
    assert_eq!(manager.speed().unwrap(), ObdValue::VehicleSpeed(60.0));
    assert_eq!(manager.coolant_temp().unwrap(), ObdValue::CoolantTemp(83.0));
    assert_eq!(manager.engine_load().unwrap(), ObdValue::EngineLoad(100.0));
    assert_eq!(manager.battery_voltage().unwrap(), ObdValue::BatteryVoltage(13.8));
    assert_eq!(manager.query_pid(0x0F).unwrap(), ObdValue::IntakeAirTemp(25.0));
    assert_eq!(manager.query_pid(0x01).unwrap(), ObdValue::RawBytes(vec![0x00, 0x07, 0xE5, 0x00]));
    assert_eq!(manager.vin().unwrap(), "1G1JC5444R7252367");
    assert!(manager.supported_pids().unwrap().contains(&0x0C));

    let raw = manager.send_raw(&Command::at("ATDP")).unwrap();
    assert_eq!(raw.lines(), &["AUTO, ISO 15765-4 (CAN 11/500)".to_string()]);
}

#[test]
fn dtc_read_and_clear() {
    let (manager, sim, _) = connected();
    sim.update_vehicle(|v| {
        v.dtcs = vec!["P0104".parse().unwrap(), "U0100".parse().unwrap()];
        v.mil_on = true;
    });
    let report = manager.read_dtcs().unwrap();
    assert!(report.status.mil_on);
    assert_eq!(report.status.dtc_count, 2);
    assert_eq!(
        report.codes.iter().map(DtcCode::to_string).collect::<Vec<_>>(),
        vec!["P0104", "U0100"]
    );

    manager.clear_dtcs().unwrap();
    let report = manager.read_dtcs().unwrap();
    assert!(!report.status.mil_on);
    assert!(report.codes.is_empty());

    sim.set_reply_override("04", Some("?"));
    assert!(matches!(
        manager.clear_dtcs(),
        Err(ManagerError::Protocol(ProtocolError::ClearFailed(_)))
    ));
    // A failed clear leaves the connection alone
    assert!(manager.is_connected());
}

#[test]
fn queries_need_a_connection() {
    let _ = env_logger::try_init();
    let manager = ObdManager::new(options(), VoidHandler);
    assert!(matches!(manager.rpm(), Err(ManagerError::NotConnected)));
    assert!(matches!(manager.read_dtcs(), Err(ManagerError::NotConnected)));

    let (manager, sim, _) = connected();
    manager.disconnect();
    sim.clear_log();
    assert!(matches!(manager.speed(), Err(ManagerError::NotConnected)));
    assert!(matches!(manager.clear_dtcs(), Err(ManagerError::NotConnected)));
    assert!(matches!(manager.send_raw(&Command::at("ATI")), Err(ManagerError::NotConnected)));
    assert_eq!(sim.write_count(), 0);
}

#[test]
fn connect_twice() {
    let (manager, _sim, _) = connected();
    let other = SimulatedAdapter::default();
    assert!(matches!(
        manager.connect_transport(Box::new(other.clone())),
        Err(ManagerError::AlreadyConnected)
    ));
    assert_eq!(other.write_count(), 0);
    assert!(manager.is_connected());
}

#[test]
fn init_failure_ends_disconnected() {
    let _ = env_logger::try_init();
    let recorder = Recorder::default();
    let manager = ObdManager::new(options(), recorder.handler());
    let sim = SimulatedAdapter::default();
    sim.set_reply_override("ATL0", Some("?"));
    match manager.connect_transport(Box::new(sim.clone())) {
        Err(ManagerError::Protocol(ProtocolError::InitFailed { step, .. })) => {
            assert_eq!(step, InitStep::LinefeedsOff)
        }
        r => panic!("unexpected {r:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Disconnected
        ]
    );
    assert!(!sim.is_open());

    // A later attempt is allowed
    sim.clear_reply_overrides();
    manager.connect_transport(Box::new(sim)).unwrap();
    assert!(manager.is_connected());
}

#[test]
fn open_failure() {
    let _ = env_logger::try_init();
    let manager = ObdManager::new(options(), VoidHandler);
    let sim = SimulatedAdapter::default();
    sim.set_open_fails(true);
    assert!(matches!(
        manager.connect_transport(Box::new(sim)),
        Err(ManagerError::Transport(TransportError::DeviceNotFound { .. }))
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn connect_from_config() {
    let _ = env_logger::try_init();
    let manager = ObdManager::new(options(), VoidHandler);
    let settings = SimulatorSettings {
        can_framing: false,
        ..Default::default()
    };
    manager.connect(&TransportConfig::Simulator(settings)).unwrap();
    assert_eq!(manager.vin().unwrap(), "1G1JC5444R7252367");
    manager.disconnect();
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn lost_link_disconnects() {
    let (manager, sim, recorder) = connected();
    sim.drop_link();
    assert!(matches!(
        manager.rpm(),
        Err(ManagerError::Protocol(ProtocolError::Channel(
            ChannelError::TransportClosed { .. }
        )))
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Disconnected
        ]
    );
    let events = recorder.0.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, ManagerEvent::Transport(TransportEvent::LineError(_)))));
    assert!(events.iter().any(|e| matches!(e, ManagerEvent::QueryFailed { query: "rpm", .. })));
}

#[test]
fn no_data_keeps_connection() {
    let (manager, sim, _) = connected();
    sim.update_vehicle(|v| v.ecu_online = false);
    assert!(matches!(
        manager.rpm(),
        Err(ManagerError::Protocol(ProtocolError::NoData { .. }))
    ));
    assert!(manager.is_connected());
    sim.update_vehicle(|v| v.ecu_online = true);
    assert!(manager.rpm().is_ok());
}

#[test]
fn bus_init_error_is_reported() {
    let (manager, sim, _) = connected();
    sim.set_reply_override("010C", Some("BUS INIT: ...ERROR"));
    sim.set_reply_override("03", Some("BUS INIT: ...ERROR"));
    assert!(matches!(
        manager.rpm(),
        Err(ManagerError::Protocol(ProtocolError::AdapterError { message, .. }))
            if message == "BUS INIT: ...ERROR"
    ));
    assert!(matches!(
        manager.read_dtcs(),
        Err(ManagerError::Protocol(ProtocolError::AdapterError { .. }))
    ));
    assert!(manager.is_connected());
}

// The manager is handed to its own event handler once built
type ManagerSlot = Arc<OnceLock<Weak<ObdManager>>>;

fn with_handler<F>(f: F) -> (Arc<ObdManager>, Recorder)
where
    F: Fn(&ObdManager, &ManagerEvent) + Send + Sync + 'static,
{
    let _ = env_logger::try_init();
    let recorder = Recorder::default();
    let record = recorder.handler();
    let slot: ManagerSlot = Arc::default();
    let handler_slot = slot.clone();
    let manager = Arc::new(ObdManager::new(options(), move |e: ManagerEvent| {
        record(e.clone());
        if let Some(m) = handler_slot.get().and_then(Weak::upgrade) {
            f(&m, &e);
        }
    }));
    let _ = slot.set(Arc::downgrade(&manager));
    (manager, recorder)
}

#[test]
fn handler_may_disconnect_on_line_error() {
    let (manager, recorder) = with_handler(|m, e| {
        if matches!(e, ManagerEvent::Transport(TransportEvent::LineError(_))) {
            m.disconnect();
        }
    });
    let sim = SimulatedAdapter::default();
    manager.connect_transport(Box::new(sim.clone())).unwrap();

    sim.drop_link();
    assert!(manager.rpm().is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
}

#[test]
fn reconnect_while_settling_a_lost_link() {
    let replacement = SimulatedAdapter::default();
    let reconnected = Arc::new(AtomicBool::new(false));
    let (manager, recorder) = {
        let replacement = replacement.clone();
        let reconnected = reconnected.clone();
        with_handler(move |m, e| {
            if matches!(e, ManagerEvent::StateChanged { new: ConnectionState::Error, .. })
                && !reconnected.swap(true, Ordering::SeqCst)
            {
                m.connect_transport(Box::new(replacement.clone())).unwrap();
            }
        })
    };
    let sim = SimulatedAdapter::default();
    manager.connect_transport(Box::new(sim.clone())).unwrap();

    sim.drop_link();
    assert!(manager.rpm().is_err());
    assert!(reconnected.load(Ordering::SeqCst));
    // The new session survives the old one winding down
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    replacement.update_vehicle(|v| v.rpm = 2000.0);
    assert_eq!(manager.rpm().unwrap(), ObdValue::EngineRpm(2000.0));
}
