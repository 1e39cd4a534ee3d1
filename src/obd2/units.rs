//! Decoded physical values returned by the protocol engine

use std::fmt::{Display, Formatter};

/// Speed conversions
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq)]
pub struct Speed(f32); // km/h

impl Speed {
    /// From kilometers per hour
    pub fn from_kmh(kmh: f32) -> Self {
        Self(kmh)
    }

    /// Returns the speed in kilometers per hour
    pub fn to_kmh(&self) -> f32 {
        self.0
    }

    /// Returns the speed in miles per hour
    pub fn to_mph(&self) -> f32 {
        self.0 / 1.609_344
    }
}

/// Temperature conversions
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq)]
pub struct Temperature(f32); // °C

impl Temperature {
    /// From celsius
    pub fn from_celsius(c: f32) -> Self {
        Self(c)
    }

    /// Returns the temperature in celsius
    pub fn to_celsius(&self) -> f32 {
        self.0
    }

    /// Returns the temperature in fahrenheit
    pub fn to_fahrenheit(&self) -> f32 {
        (self.0 * (9.0 / 5.0)) + 32.0
    }
}

/// A decoded measurement. The `f32` is always in the metric unit given by [ObdValue::unit]
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObdValue {
    /// Engine speed (rpm)
    EngineRpm(f32),
    /// Vehicle speed (km/h)
    VehicleSpeed(f32),
    /// Engine coolant temperature (°C)
    CoolantTemp(f32),
    /// Supply voltage measured by the adapter (V)
    BatteryVoltage(f32),
    /// Calculated engine load (%)
    EngineLoad(f32),
    /// Intake air temperature (°C)
    IntakeAirTemp(f32),
    /// Absolute throttle position (%)
    ThrottlePosition(f32),
    /// Mass air flow (g/s)
    MassAirFlow(f32),
    /// Fuel tank level (%)
    FuelTankLevel(f32),
    /// Ignition timing advance (° before TDC)
    TimingAdvance(f32),
    /// Control module supply voltage reported by the ECU (V)
    ControlModuleVoltage(f32),
    /// Payload of a PID this crate has no formula for
    RawBytes(Vec<u8>),
}

impl ObdValue {
    /// Human readable name of the measurement
    pub fn name(&self) -> &'static str {
        match self {
            ObdValue::EngineRpm(_) => "Engine speed",
            ObdValue::VehicleSpeed(_) => "Vehicle speed",
            ObdValue::CoolantTemp(_) => "Coolant temperature",
            ObdValue::BatteryVoltage(_) => "Battery voltage",
            ObdValue::EngineLoad(_) => "Engine load",
            ObdValue::IntakeAirTemp(_) => "Intake air temperature",
            ObdValue::ThrottlePosition(_) => "Throttle position",
            ObdValue::MassAirFlow(_) => "Mass air flow",
            ObdValue::FuelTankLevel(_) => "Fuel tank level",
            ObdValue::TimingAdvance(_) => "Timing advance",
            ObdValue::ControlModuleVoltage(_) => "Control module voltage",
            ObdValue::RawBytes(_) => "Raw data",
        }
    }

    /// Numeric value in metric units. `None` for [ObdValue::RawBytes]
    pub fn value(&self) -> Option<f32> {
        match self {
            ObdValue::EngineRpm(v)
            | ObdValue::VehicleSpeed(v)
            | ObdValue::CoolantTemp(v)
            | ObdValue::BatteryVoltage(v)
            | ObdValue::EngineLoad(v)
            | ObdValue::IntakeAirTemp(v)
            | ObdValue::ThrottlePosition(v)
            | ObdValue::MassAirFlow(v)
            | ObdValue::FuelTankLevel(v)
            | ObdValue::TimingAdvance(v)
            | ObdValue::ControlModuleVoltage(v) => Some(*v),
            ObdValue::RawBytes(_) => None,
        }
    }

    /// Metric unit of [ObdValue::value]
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            ObdValue::EngineRpm(_) => Some("rpm"),
            ObdValue::VehicleSpeed(_) => Some("km/h"),
            ObdValue::CoolantTemp(_) | ObdValue::IntakeAirTemp(_) => Some("°C"),
            ObdValue::BatteryVoltage(_) | ObdValue::ControlModuleVoltage(_) => Some("V"),
            ObdValue::EngineLoad(_) | ObdValue::ThrottlePosition(_) | ObdValue::FuelTankLevel(_) => {
                Some("%")
            }
            ObdValue::MassAirFlow(_) => Some("g/s"),
            ObdValue::TimingAdvance(_) => Some("°"),
            ObdValue::RawBytes(_) => None,
        }
    }

    /// Value and unit in imperial form, for the measurements that have one
    pub fn imperial(&self) -> Option<(f32, &'static str)> {
        match self {
            ObdValue::VehicleSpeed(v) => Some((Speed::from_kmh(*v).to_mph(), "mph")),
            ObdValue::CoolantTemp(v) | ObdValue::IntakeAirTemp(v) => {
                Some((Temperature::from_celsius(*v).to_fahrenheit(), "°F"))
            }
            _ => None,
        }
    }
}

impl Display for ObdValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.value(), self.unit()) {
            (Some(v), Some(u)) => write!(f, "{}: {v:.1} {u}", self.name()),
            _ => match self {
                ObdValue::RawBytes(b) => write!(f, "{}: {b:02X?}", self.name()),
                _ => write!(f, "{}", self.name()),
            },
        }
    }
}
