use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use obd_diagnostics::{
    ChannelError, Command, ConnectionState, ManagerError, ManagerOptions, ObdManager,
    ProtocolError, VoidHandler,
    channel::{ChannelSettings, CommandChannel},
    obd2::EngineSettings,
    hardware::{
        Transport,
        simulation::{AdapterLogEntry, SimulatedAdapter},
    },
};

fn open_sim() -> SimulatedAdapter {
    let _ = env_logger::try_init();
    let mut sim = SimulatedAdapter::default();
    sim.open().unwrap();
    sim
}

#[test]
fn silent_adapter_times_out_on_time() {
    let sim = open_sim();
    sim.set_silent(true);
    let read_timeout = Duration::from_millis(150);
    let channel = CommandChannel::new(
        Box::new(sim),
        ChannelSettings {
            read_timeout,
            ..Default::default()
        },
    );
    let start = Instant::now();
    match channel.send(&Command::pid(0x01, 0x0C)) {
        Err(ChannelError::Timeout { command, elapsed }) => {
            assert_eq!(command, "010C");
            assert!(elapsed >= read_timeout);
        }
        r => panic!("expected a timeout, got {r:?}"),
    }
    assert!(start.elapsed() < read_timeout + Duration::from_millis(150));
}

#[test]
fn reply_without_prompt_ends_on_idle() {
    let sim = open_sim();
    sim.set_prompt_enabled(false);
    let channel = CommandChannel::new(
        Box::new(sim),
        ChannelSettings {
            read_timeout: Duration::from_millis(80),
            max_response_time: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
        },
    );
    let r = channel.send(&Command::at("ATI")).unwrap();
    assert!(!r.is_complete());
    assert_eq!(r.lines(), &["ELM327 v1.5".to_string()]);
    assert!(r.elapsed() < Duration::from_millis(300 + 100));
}

#[test]
fn concurrent_sends_never_interleave() {
    let sim = open_sim();
    sim.set_response_delay(Duration::from_millis(10));
    let channel = Arc::new(CommandChannel::new(Box::new(sim.clone()), ChannelSettings::default()));

    let pids = [0x04u8, 0x05, 0x0C, 0x0D];
    let handles: Vec<_> = pids
        .iter()
        .map(|pid| {
            let channel = channel.clone();
            let pid = *pid;
            thread::spawn(move || {
                for _ in 0..5 {
                    let r = channel.send(&Command::pid(0x01, pid)).unwrap();
                    let expected = format!("41 {pid:02X}");
                    assert!(
                        r.lines().iter().any(|l| l.starts_with(&expected)),
                        "{pid:02X} got {r:?}"
                    );
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Every command is answered, prompt included, before the next one is written
    let log = sim.log();
    assert_eq!(log.len(), pids.len() * 5 * 2);
    for pair in log.chunks(2) {
        match pair {
            [AdapterLogEntry::Command(c), AdapterLogEntry::Prompt(p)] => assert_eq!(c, p),
            _ => panic!("interleaved traffic: {pair:?}"),
        }
    }
    assert_eq!(channel.queue_len(), 0);
}

#[test]
fn shutdown_interrupts_pending_read() {
    let sim = open_sim();
    sim.set_silent(true);
    let channel = Arc::new(CommandChannel::new(
        Box::new(sim.clone()),
        ChannelSettings {
            read_timeout: Duration::from_secs(5),
            max_response_time: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        },
    ));
    let reader = {
        let channel = channel.clone();
        thread::spawn(move || {
            let start = Instant::now();
            (channel.send(&Command::service(0x03)), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(100));
    channel.shutdown();
    let (res, elapsed) = reader.join().unwrap();
    assert!(matches!(res, Err(ChannelError::TransportClosed { .. })));
    assert!(elapsed < Duration::from_secs(1));
    assert!(!sim.is_open());
}

#[test]
fn disconnect_interrupts_query() {
    let _ = env_logger::try_init();
    let mut options = ManagerOptions::default();
    options.channel.read_timeout = Duration::from_secs(5);
    let manager = Arc::new(ObdManager::new(options, VoidHandler));
    let sim = SimulatedAdapter::default();
    manager.connect_transport(Box::new(sim.clone())).unwrap();
    sim.set_silent(true);

    let query = {
        let manager = manager.clone();
        thread::spawn(move || manager.rpm())
    };
    thread::sleep(Duration::from_millis(100));
    let start = Instant::now();
    manager.disconnect();
    let res = query.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        res,
        Err(ManagerError::Protocol(ProtocolError::Channel(
            ChannelError::TransportClosed { .. }
        )))
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn disconnect_cancels_pending_connect() {
    let _ = env_logger::try_init();
    let mut options = ManagerOptions::default();
    options.engine = EngineSettings {
        reset_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let manager = Arc::new(ObdManager::new(options, VoidHandler));
    let sim = SimulatedAdapter::default();
    sim.set_silent(true);

    let connect = {
        let manager = manager.clone();
        let sim = sim.clone();
        thread::spawn(move || manager.connect_transport(Box::new(sim)))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.state(), ConnectionState::Connecting);
    let start = Instant::now();
    manager.disconnect();
    let res = connect.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(res, Err(ManagerError::NotConnected)), "{res:?}");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!sim.is_open());
}
