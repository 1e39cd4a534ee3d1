//! Service 01 data PIDs with a known decoding formula

use strum_macros::{EnumIter, EnumString};

use super::ObdValue;

/// OBD2 data PIDs read with service 01
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, EnumString, EnumIter, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataPid {
    /// 0x04
    CalculatedEngineLoad,
    /// 0x05
    EngineCoolantTemp,
    /// 0x0C
    EngineSpeed,
    /// 0x0D
    VehicleSpeed,
    /// 0x0E
    TimingAdvance,
    /// 0x0F
    IntakeAirTemperature,
    /// 0x10
    MassAirFlow,
    /// 0x11
    ThrottlePosition,
    /// 0x2F
    FuelTankLevelInput,
    /// 0x42
    ControlModuleVoltage,
    /// Any other PID. The payload is returned undecoded
    Unknown(u8),
}

impl From<u8> for DataPid {
    fn from(x: u8) -> Self {
        match x {
            0x04 => DataPid::CalculatedEngineLoad,
            0x05 => DataPid::EngineCoolantTemp,
            0x0C => DataPid::EngineSpeed,
            0x0D => DataPid::VehicleSpeed,
            0x0E => DataPid::TimingAdvance,
            0x0F => DataPid::IntakeAirTemperature,
            0x10 => DataPid::MassAirFlow,
            0x11 => DataPid::ThrottlePosition,
            0x2F => DataPid::FuelTankLevelInput,
            0x42 => DataPid::ControlModuleVoltage,
            x => DataPid::Unknown(x),
        }
    }
}

impl From<DataPid> for u8 {
    fn from(x: DataPid) -> Self {
        match x {
            DataPid::CalculatedEngineLoad => 0x04,
            DataPid::EngineCoolantTemp => 0x05,
            DataPid::EngineSpeed => 0x0C,
            DataPid::VehicleSpeed => 0x0D,
            DataPid::TimingAdvance => 0x0E,
            DataPid::IntakeAirTemperature => 0x0F,
            DataPid::MassAirFlow => 0x10,
            DataPid::ThrottlePosition => 0x11,
            DataPid::FuelTankLevelInput => 0x2F,
            DataPid::ControlModuleVoltage => 0x42,
            DataPid::Unknown(x) => x,
        }
    }
}

impl DataPid {
    /// PID byte
    pub fn pid(&self) -> u8 {
        (*self).into()
    }

    /// Number of data bytes the ECU returns after the `41 <pid>` header.
    /// `None` if unknown
    pub fn data_len(&self) -> Option<usize> {
        match self {
            DataPid::EngineSpeed | DataPid::MassAirFlow | DataPid::ControlModuleVoltage => Some(2),
            DataPid::Unknown(_) => None,
            _ => Some(1),
        }
    }

    /// Decodes the data bytes following the `41 <pid>` header.
    ///
    /// Returns `None` if the byte count does not match [DataPid::data_len]
    pub fn decode(&self, data: &[u8]) -> Option<ObdValue> {
        if let Some(len) = self.data_len() {
            if data.len() != len {
                return None;
            }
        }
        let a = data.first().copied().unwrap_or_default() as f32;
        let ab = || u16::from_be_bytes([data[0], data[1]]) as f32;
        Some(match self {
            DataPid::CalculatedEngineLoad => ObdValue::EngineLoad(a * 100.0 / 255.0),
            DataPid::EngineCoolantTemp => ObdValue::CoolantTemp(a - 40.0),
            DataPid::EngineSpeed => ObdValue::EngineRpm(ab() / 4.0),
            DataPid::VehicleSpeed => ObdValue::VehicleSpeed(a),
            DataPid::TimingAdvance => ObdValue::TimingAdvance(a / 2.0 - 64.0),
            DataPid::IntakeAirTemperature => ObdValue::IntakeAirTemp(a - 40.0),
            DataPid::MassAirFlow => ObdValue::MassAirFlow(ab() / 100.0),
            DataPid::ThrottlePosition => ObdValue::ThrottlePosition(a * 100.0 / 255.0),
            DataPid::FuelTankLevelInput => ObdValue::FuelTankLevel(a * 100.0 / 255.0),
            DataPid::ControlModuleVoltage => ObdValue::ControlModuleVoltage(ab() / 1000.0),
            DataPid::Unknown(_) => ObdValue::RawBytes(data.to_vec()),
        })
    }
}
