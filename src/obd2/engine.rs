//! The OBD2 protocol engine and adapter initialization

use std::{
    sync::{PoisonError, RwLock},
    time::Duration,
};

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use super::{ObdProtocol, ProtocolError, ProtocolResult, reply_messages};
use crate::{
    channel::{ChannelError, ChannelSettings, Command, CommandChannel, RawResponse},
    hardware::Transport,
};

/// Adapter initialization steps, in the order they run
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InitStep {
    /// `ATZ`
    #[strum(serialize = "reset")]
    Reset,
    /// `ATE0`
    #[strum(serialize = "echo off")]
    EchoOff,
    /// `ATL0`
    #[strum(serialize = "linefeeds off")]
    LinefeedsOff,
    /// `ATH0`
    #[strum(serialize = "headers off")]
    HeadersOff,
    /// `ATSPn`
    #[strum(serialize = "set protocol")]
    SetProtocol,
}

impl InitStep {
    /// Adapter command for this step
    pub fn command(&self, protocol: ObdProtocol) -> Command {
        match self {
            InitStep::Reset => Command::at("ATZ"),
            InitStep::EchoOff => Command::at("ATE0"),
            InitStep::LinefeedsOff => Command::at("ATL0"),
            InitStep::HeadersOff => Command::at("ATH0"),
            InitStep::SetProtocol => Command::at(protocol.select_command()),
        }
    }
}

/// Protocol engine configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineSettings {
    /// Protocol selected during initialization
    pub protocol: ObdProtocol,
    /// Read timeout for `ATZ`. A reset takes the adapter up to a second
    pub reset_timeout: Duration,
    /// How many times a data query that timed out is sent again
    pub timeout_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::Auto,
            reset_timeout: Duration::from_millis(5000),
            timeout_retries: 1,
        }
    }
}

/// OBD2 protocol engine, one per adapter connection
#[derive(Debug)]
pub struct ObdEngine {
    channel: CommandChannel,
    settings: EngineSettings,
    adapter_version: RwLock<Option<String>>,
}

impl ObdEngine {
    /// Creates an engine over an opened transport. The adapter is not touched
    /// until [ObdEngine::initialize]
    pub fn new(
        transport: Box<dyn Transport>,
        channel_settings: ChannelSettings,
        settings: EngineSettings,
    ) -> Self {
        Self {
            channel: CommandChannel::new(transport, channel_settings),
            settings,
            adapter_version: RwLock::new(None),
        }
    }

    /// The command channel used by the engine
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Identification the adapter printed on reset, EG: `ELM327 v1.5`
    pub fn adapter_version(&self) -> Option<String> {
        self.adapter_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the initialization sequence. Every step is a single round trip and
    /// none is skipped or retried.
    pub fn initialize(&self) -> ProtocolResult<()> {
        for step in InitStep::iter() {
            let cmd = step.command(self.settings.protocol);
            let timeout = match step {
                InitStep::Reset => self.settings.reset_timeout,
                _ => self.channel.settings().read_timeout,
            };
            let resp = match self.channel.send_with_timeout(&cmd, timeout) {
                Ok(r) => r,
                Err(ChannelError::Timeout { .. }) => {
                    return Err(ProtocolError::InitFailed {
                        step,
                        reply: String::new(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            if resp.is_empty() || resp.lines().iter().any(|l| l.contains('?')) {
                return Err(ProtocolError::InitFailed {
                    step,
                    reply: resp.to_string(),
                });
            }
            if step == InitStep::Reset {
                let version = resp
                    .lines()
                    .iter()
                    .rev()
                    .find(|l| l.to_ascii_uppercase().contains("ELM"))
                    .or_else(|| resp.lines().last())
                    .cloned();
                *self
                    .adapter_version
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = version;
            }
            log::debug!("Init step '{step}' done: {resp}");
        }
        log::info!(
            "Adapter initialized ({}), protocol {}",
            self.adapter_version().unwrap_or_default(),
            self.settings.protocol
        );
        Ok(())
    }

    /// Sends a command verbatim and returns the unparsed reply. Never retried
    pub fn send_raw(&self, cmd: &Command) -> ProtocolResult<RawResponse> {
        Ok(self.channel.send(cmd)?)
    }

    /// Sends a data query, retrying after a timeout as configured
    pub(crate) fn query(&self, cmd: &Command) -> ProtocolResult<RawResponse> {
        let mut attempt = 0;
        loop {
            match self.channel.send(cmd) {
                Err(ChannelError::Timeout { elapsed, .. })
                    if attempt < self.settings.timeout_retries =>
                {
                    attempt += 1;
                    log::warn!(
                        "'{cmd}' timed out after {elapsed:?}, retrying ({attempt}/{})",
                        self.settings.timeout_retries
                    );
                }
                res => return Ok(res?),
            }
        }
    }

    /// Sends a mode/PID request and returns the data bytes after the `4x <pid>` header
    pub fn query_data(&self, mode: u8, pid: Option<u8>) -> ProtocolResult<Vec<u8>> {
        let cmd = match pid {
            Some(pid) => Command::pid(mode, pid),
            None => Command::service(mode),
        };
        let resp = self.query(&cmd)?;
        let messages = reply_messages(&cmd, &resp)?;
        super::find_response(&cmd, &messages, mode, pid)
    }

    /// Supply voltage measured by the adapter (`ATRV`)
    pub fn battery_voltage(&self) -> ProtocolResult<super::ObdValue> {
        let cmd = Command::at("ATRV");
        let resp = self.query(&cmd)?;
        let line = resp
            .lines()
            .iter()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ProtocolError::EmptyResponse {
                command: cmd.to_string(),
            })?;
        if line.trim() == "?" {
            return Err(ProtocolError::Rejected {
                command: cmd.to_string(),
            });
        }
        line.trim()
            .trim_end_matches(['V', 'v'])
            .trim()
            .parse::<f32>()
            .map(super::ObdValue::BatteryVoltage)
            .map_err(|_| ProtocolError::MalformedPayload {
                command: cmd.to_string(),
                reason: format!("'{line}' is not a voltage"),
            })
    }

    /// Aborts any pending command and closes the transport
    pub fn shutdown(&self) {
        self.channel.shutdown()
    }
}

#[cfg(test)]
mod engine_test {
    use std::time::Duration;

    use super::*;
    use crate::{
        dtc::DtcCode,
        hardware::simulation::{SimulatedAdapter, SimulatorSettings},
        obd2::{DataPid, ObdValue},
    };

    fn settings() -> (ChannelSettings, EngineSettings) {
        (
            ChannelSettings {
                read_timeout: Duration::from_millis(100),
                max_response_time: Duration::from_millis(1000),
                poll_interval: Duration::from_millis(5),
            },
            EngineSettings {
                reset_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    fn engine_with(sim_settings: SimulatorSettings) -> (ObdEngine, SimulatedAdapter) {
        let _ = env_logger::try_init();
        let mut sim = SimulatedAdapter::new(sim_settings);
        sim.open().unwrap();
        let (c, e) = settings();
        let engine = ObdEngine::new(Box::new(sim.clone()), c, e);
        (engine, sim)
    }

    fn engine() -> (ObdEngine, SimulatedAdapter) {
        let (engine, sim) = engine_with(SimulatorSettings::default());
        engine.initialize().unwrap();
        sim.clear_log();
        (engine, sim)
    }

    #[test]
    fn init_sequence() {
        let (engine, sim) = engine_with(SimulatorSettings::default());
        engine.initialize().unwrap();
        assert_eq!(sim.commands(), vec!["ATZ", "ATE0", "ATL0", "ATH0", "ATSP0"]);
        assert_eq!(engine.adapter_version().as_deref(), Some("ELM327 v1.5"));
    }

    #[test]
    fn init_rejected_step() {
        let (engine, sim) = engine_with(SimulatorSettings::default());
        sim.set_reply_override("ATE0", Some("?"));
        match engine.initialize() {
            Err(ProtocolError::InitFailed { step, reply }) => {
                assert_eq!(step, InitStep::EchoOff);
                assert_eq!(reply, "?");
            }
            r => panic!("unexpected {r:?}"),
        }
        // Nothing after the failed step
        assert_eq!(sim.commands(), vec!["ATZ", "ATE0"]);
    }

    #[test]
    fn init_silent_adapter() {
        let (engine, sim) = engine_with(SimulatorSettings::default());
        sim.set_silent(true);
        assert!(matches!(
            engine.initialize(),
            Err(ProtocolError::InitFailed { step: InitStep::Reset, .. })
        ));
        assert_eq!(sim.commands(), vec!["ATZ"]);
    }

    #[test]
    fn init_empty_reply() {
        let (engine, sim) = engine_with(SimulatorSettings::default());
        sim.set_reply_override("ATH0", Some(""));
        assert!(matches!(
            engine.initialize(),
            Err(ProtocolError::InitFailed { step: InitStep::HeadersOff, .. })
        ));
    }

    #[test]
    fn read_values() {
        let (engine, sim) = engine();
        sim.update_vehicle(|v| {
            v.rpm = 1726.0;
            v.speed_kmh = 60;
            v.coolant_temp_c = 83;
        });
        assert_eq!(engine.read_pid(DataPid::EngineSpeed).unwrap(), ObdValue::EngineRpm(1726.0));
        assert_eq!(engine.read_pid(DataPid::VehicleSpeed).unwrap(), ObdValue::VehicleSpeed(60.0));
        assert_eq!(engine.read_pid(DataPid::EngineCoolantTemp).unwrap(), ObdValue::CoolantTemp(83.0));
        assert_eq!(engine.battery_voltage().unwrap(), ObdValue::BatteryVoltage(13.8));
    }

    #[test]
    fn error_replies() {
        let (engine, sim) = engine();
        sim.set_reply_override("010C", Some("41 0C 1A"));
        assert!(matches!(
            engine.read_pid(DataPid::EngineSpeed),
            Err(ProtocolError::MalformedPayload { .. })
        ));
        sim.set_reply_override("010C", Some("41 0D 3C"));
        assert!(matches!(
            engine.read_pid(DataPid::EngineSpeed),
            Err(ProtocolError::MismatchedResponse { .. })
        ));
        sim.set_reply_override("010C", Some("BUS ERROR"));
        assert!(matches!(
            engine.read_pid(DataPid::EngineSpeed),
            Err(ProtocolError::AdapterError { .. })
        ));
        sim.set_reply_override("ATRV", Some("?"));
        assert!(matches!(engine.battery_voltage(), Err(ProtocolError::Rejected { .. })));
        sim.update_vehicle(|v| v.ecu_online = false);
        assert!(matches!(
            engine.read_pid(DataPid::VehicleSpeed),
            Err(ProtocolError::NoData { .. })
        ));
    }

    #[test]
    fn timeout_retried_once() {
        let (engine, sim) = engine();
        sim.set_reply_override("010D", None);
        assert!(matches!(
            engine.read_pid(DataPid::VehicleSpeed),
            Err(ProtocolError::Channel(ChannelError::Timeout { .. }))
        ));
        assert_eq!(sim.commands(), vec!["010D", "010D"]);

        // Raw passthrough is not retried
        sim.clear_log();
        assert!(engine.send_raw(&Command::raw("010D")).is_err());
        assert_eq!(sim.commands(), vec!["010D"]);
    }

    #[test]
    fn raw_passthrough() {
        let (engine, _sim) = engine();
        let r = engine.send_raw(&Command::at("ATI")).unwrap();
        assert_eq!(r.lines(), &["ELM327 v1.5".to_string()]);
        let r = engine.send_raw(&Command::raw("0105")).unwrap();
        assert_eq!(r.lines(), &["SEARCHING...".to_string(), "41 05 80".to_string()]);
    }

    #[test]
    fn dtcs_can_format() {
        let (engine, sim) = engine();
        let codes = vec![DtcCode::decode([0x01, 0x04]), DtcCode::decode([0x03, 0x01]), DtcCode::decode([0xC1, 0x00])];
        sim.update_vehicle(|v| {
            v.dtcs = codes.clone();
            v.mil_on = true;
        });
        let report = engine.read_dtcs().unwrap();
        assert!(report.status.mil_on);
        assert_eq!(report.status.dtc_count, 3);
        assert_eq!(report.codes, codes);
        assert_eq!(sim.commands(), vec!["0101", "03"]);
    }

    #[test]
    fn dtcs_legacy_format() {
        let (engine, sim) = engine_with(SimulatorSettings {
            can_framing: false,
            ..Default::default()
        });
        engine.initialize().unwrap();
        let codes: Vec<DtcCode> = ["P0104", "P0301", "C0123", "B1234"]
            .iter()
            .map(|c| c.parse().unwrap())
            .collect();
        sim.update_vehicle(|v| v.dtcs = codes.clone());
        assert_eq!(engine.stored_dtcs().unwrap(), codes);
        sim.update_vehicle(|v| v.dtcs.clear());
        assert!(engine.stored_dtcs().unwrap().is_empty());
    }

    #[test]
    fn no_data_means_no_dtcs() {
        let (engine, sim) = engine();
        sim.set_reply_override("03", Some("NO DATA"));
        assert!(engine.stored_dtcs().unwrap().is_empty());
        sim.set_reply_override("03", Some("CAN ERROR"));
        assert!(matches!(engine.stored_dtcs(), Err(ProtocolError::AdapterError { .. })));
    }

    #[test]
    fn clear_dtcs() {
        let (engine, sim) = engine();
        sim.update_vehicle(|v| {
            v.dtcs = vec![DtcCode::decode([0x01, 0x04])];
            v.mil_on = true;
        });
        engine.clear_dtcs().unwrap();
        assert!(sim.vehicle().dtcs.is_empty());
        assert!(!sim.vehicle().mil_on);

        for reply in [Some("?"), Some("CAN ERROR"), Some(""), None] {
            sim.set_reply_override("04", reply);
            sim.clear_log();
            assert!(matches!(engine.clear_dtcs(), Err(ProtocolError::ClearFailed(_))), "{reply:?}");
            assert_eq!(sim.commands(), vec!["04"]);
        }
    }

    #[test]
    fn supported_pid_list() {
        let (engine, _sim) = engine();
        assert_eq!(
            engine.supported_pids().unwrap(),
            vec![0x01, 0x04, 0x05, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x2F, 0x42]
        );
    }

    #[test]
    fn vin_formats() {
        let (engine, _sim) = engine();
        assert_eq!(engine.vin().unwrap(), "1G1JC5444R7252367");

        let (engine, _sim) = engine_with(SimulatorSettings {
            can_framing: false,
            ..Default::default()
        });
        engine.initialize().unwrap();
        assert_eq!(engine.vin().unwrap(), "1G1JC5444R7252367");
    }
}
