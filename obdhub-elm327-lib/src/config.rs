//! Hub configuration as loaded from JSON.

use std::time::Duration;

use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::decode::NO_FAULTS;
use crate::descriptor::Registry;
use crate::engine::EngineSettings;
use crate::error::ConfigError;
use crate::presets::{PidPreset, PresetQuery};
use crate::sink::SinkId;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

const fn default_mode() -> u8 {
    0x01
}

const fn default_raw_mode() -> u8 {
    0x22
}

/// A numeric sensor: a preset, an explicit mode/PID, or an AT command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub id: SinkId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<PidPreset>,
    #[serde(default = "default_mode")]
    pub mode: u8,
    /// Overrides the preset's PID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<u8>,
}

impl SensorConfig {
    /// Sensor from a preset, with the preset's defaults
    pub fn preset(id: impl Into<SinkId>, preset: PidPreset) -> Self {
        Self {
            id: id.into(),
            preset: Some(preset),
            mode: default_mode(),
            pid: None,
            at_command: None,
            name: None,
            unit: None,
            accuracy: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.preset.map(|p| p.info().name.to_string()))
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn unit(&self) -> &str {
        self.unit
            .as_deref()
            .or_else(|| self.preset.map(|p| p.info().unit))
            .unwrap_or_default()
    }

    pub fn accuracy(&self) -> u8 {
        self.accuracy
            .or_else(|| self.preset.map(|p| p.info().accuracy))
            .unwrap_or(2)
    }

    fn register(&self, registry: &mut Registry) -> Result<(), ConfigError> {
        if let Some(command) = &self.at_command {
            return registry.register_at_command(command, self.id.clone());
        }
        if let Some(pid) = self.pid {
            return registry.register_numeric_pid(self.mode, pid, self.id.clone());
        }
        match self.preset.map(|p| p.info().query) {
            Some(PresetQuery::Pid(pid)) => {
                registry.register_numeric_pid(self.mode, u16::from(pid), self.id.clone())
            }
            Some(PresetQuery::AtCommand(command)) => {
                registry.register_at_command(command, self.id.clone())
            }
            None => Err(ConfigError::MissingPid {
                id: self.id.to_string(),
            }),
        }
    }
}

/// A PID whose reply is published as hex text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawPidConfig {
    pub id: SinkId,
    #[serde(default = "default_raw_mode")]
    pub mode: u8,
    #[serde(default)]
    pub pid: u16,
    /// ECU header, empty for broadcast
    #[serde(default)]
    pub header: String,
    /// Literal command sent instead of `<mode><pid>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextSensorsConfig {
    /// Stored trouble codes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtc: Option<SinkId>,
    /// Every normalized reply, for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<SinkId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinarySensorsConfig {
    /// Adapter initialized and polling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<SinkId>,
    /// RPM above zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_running: Option<SinkId>,
}

const fn default_request_interval_ms() -> u64 {
    2000
}

const fn default_request_timeout_ms() -> u64 {
    10000
}

const fn default_header_settle_ms() -> u64 {
    500
}

fn default_no_faults_text() -> String {
    NO_FAULTS.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    /// Pause between the end of one request and the next
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    /// Give up on a reply after this long
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Settle time after `ATSH`
    #[serde(default = "default_header_settle_ms")]
    pub header_settle_ms: u64,
    /// Published to the DTC sensor when no codes are stored
    #[serde(default = "default_no_faults_text")]
    pub no_faults_text: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub raw_pid_sensors: Vec<RawPidConfig>,
    #[serde(default)]
    pub text_sensors: TextSensorsConfig,
    #[serde(default)]
    pub binary_sensors: BinarySensorsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_switch: Option<SinkId>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: default_request_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            header_settle_ms: default_header_settle_ms(),
            no_faults_text: default_no_faults_text(),
            log_level: LogLevel::default(),
            sensors: Vec::new(),
            raw_pid_sensors: Vec::new(),
            text_sensors: TextSensorsConfig::default(),
            binary_sensors: BinarySensorsConfig::default(),
            connection_switch: None,
        }
    }
}

impl HubConfig {
    /// Parse a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] when the text is not a valid configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        debug!(
            "Loaded config: {} sensors, {} raw PID sensors",
            config.sensors.len(),
            config.raw_pid_sensors.len()
        );
        Ok(config)
    }

    /// The common preset sensors plus DTC and link flags.
    pub fn with_default_sensors() -> Self {
        Self {
            sensors: [
                PidPreset::Rpm,
                PidPreset::Speed,
                PidPreset::CoolantTemp,
                PidPreset::EngineLoad,
                PidPreset::BatteryVoltage,
            ]
            .into_iter()
            .map(|p| SensorConfig::preset(p.to_string(), p))
            .collect(),
            text_sensors: TextSensorsConfig {
                dtc: Some("dtc".into()),
                raw: None,
            },
            binary_sensors: BinarySensorsConfig {
                connected: Some("connected".into()),
                engine_running: Some("engine_running".into()),
            },
            ..Self::default()
        }
    }

    /// Register every configured sensor.
    ///
    /// # Errors
    ///
    /// Fails on the first sensor that cannot be turned into a valid query.
    pub fn build_registry(&self) -> Result<Registry, ConfigError> {
        let mut registry = Registry::new();
        for sensor in &self.sensors {
            sensor.register(&mut registry)?;
        }
        for raw in &self.raw_pid_sensors {
            registry.register_raw_text_pid(
                raw.mode,
                raw.pid,
                &raw.header,
                raw.command.as_deref(),
                raw.id.clone(),
            )?;
        }
        if let Some(id) = &self.text_sensors.dtc {
            registry.register_dtc_sink(id.clone());
        }
        if let Some(id) = &self.text_sensors.raw {
            registry.register_raw_reply_sink(id.clone());
        }
        if let Some(id) = &self.binary_sensors.connected {
            registry.register_link_ready_sink(id.clone());
        }
        if let Some(id) = &self.binary_sensors.engine_running {
            registry.register_engine_running_sink(id.clone());
        }
        if let Some(id) = &self.connection_switch {
            registry.register_connection_switch_sink(id.clone());
        }
        Ok(registry)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            request_interval: Duration::from_millis(self.request_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            header_settle: Duration::from_millis(self.header_settle_ms),
            no_faults_text: self.no_faults_text.clone(),
        }
    }
}
