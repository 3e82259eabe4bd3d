//! Named sensor types that fill in PID, unit and precision.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::descriptor::VOLTAGE_COMMAND;

/// What a preset polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetQuery {
    /// Mode 01 PID
    Pid(u8),
    /// Adapter command
    AtCommand(&'static str),
}

/// Defaults a preset supplies for a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetInfo {
    pub query: PresetQuery,
    pub name: &'static str,
    pub unit: &'static str,
    /// Decimal places worth showing
    pub accuracy: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum PidPreset {
    #[display("coolant_temp")]
    CoolantTemp,
    #[display("rpm")]
    Rpm,
    #[display("speed")]
    Speed,
    #[display("engine_load")]
    EngineLoad,
    #[display("intake_temp")]
    IntakeTemp,
    #[display("fuel_level")]
    FuelLevel,
    #[display("throttle")]
    Throttle,
    #[display("battery_voltage")]
    BatteryVoltage,
    #[display("intake_map")]
    IntakeMap,
    #[display("maf")]
    Maf,
    #[display("engine_runtime")]
    EngineRuntime,
    #[display("oil_temp")]
    OilTemp,
    #[display("ambient_temp")]
    AmbientTemp,
    #[display("ecu_voltage")]
    EcuVoltage,
    #[display("fuel_rate")]
    FuelRate,
    #[display("baro_pressure")]
    BaroPressure,
    #[display("egr")]
    Egr,
}

const fn pid(pid: u8, name: &'static str, unit: &'static str, accuracy: u8) -> PresetInfo {
    PresetInfo {
        query: PresetQuery::Pid(pid),
        name,
        unit,
        accuracy,
    }
}

impl PidPreset {
    pub const ALL: [Self; 17] = [
        Self::CoolantTemp,
        Self::Rpm,
        Self::Speed,
        Self::EngineLoad,
        Self::IntakeTemp,
        Self::FuelLevel,
        Self::Throttle,
        Self::BatteryVoltage,
        Self::IntakeMap,
        Self::Maf,
        Self::EngineRuntime,
        Self::OilTemp,
        Self::AmbientTemp,
        Self::EcuVoltage,
        Self::FuelRate,
        Self::BaroPressure,
        Self::Egr,
    ];

    pub const fn info(self) -> PresetInfo {
        match self {
            Self::CoolantTemp => pid(0x05, "Coolant temperature", "°C", 0),
            Self::Rpm => pid(0x0C, "Engine speed", "RPM", 0),
            Self::Speed => pid(0x0D, "Vehicle speed", "km/h", 0),
            Self::EngineLoad => pid(0x04, "Engine load", "%", 1),
            Self::IntakeTemp => pid(0x0F, "Intake air temperature", "°C", 0),
            Self::FuelLevel => pid(0x2F, "Fuel level", "%", 1),
            Self::Throttle => pid(0x11, "Throttle position", "%", 1),
            Self::BatteryVoltage => PresetInfo {
                query: PresetQuery::AtCommand(VOLTAGE_COMMAND),
                name: "Battery voltage",
                unit: "V",
                accuracy: 1,
            },
            Self::IntakeMap => pid(0x0B, "Intake manifold pressure", "kPa", 0),
            Self::Maf => pid(0x10, "Mass air flow", "g/s", 2),
            Self::EngineRuntime => pid(0x1F, "Engine run time", "s", 0),
            Self::OilTemp => pid(0x5C, "Oil temperature", "°C", 0),
            Self::AmbientTemp => pid(0x46, "Ambient temperature", "°C", 0),
            Self::EcuVoltage => pid(0x42, "Control module voltage", "V", 3),
            Self::FuelRate => pid(0x5E, "Fuel rate", "L/h", 2),
            Self::BaroPressure => pid(0x33, "Barometric pressure", "kPa", 0),
            Self::Egr => pid(0x2E, "Commanded EGR", "%", 1),
        }
    }
}
