//! ELM327 polling engine for notification-based OBD2 adapters
//!
//! This library initializes an ELM327-compatible adapter, round-robin polls a
//! configured set of queries and decodes the adapter's text replies into
//! numeric, text and boolean values. It is transport-agnostic: anything that
//! can write a command and report incoming chunks (a BLE characteristic pair,
//! a TCP socket) plugs in through [`Transport`] and [`LinkEvent`].
//!
//! ```
//! use std::time::Instant;
//! use obdhub_elm327_lib::{
//!     Engine, EngineSettings, LinkEvent, RecordingSink, RecordingTransport, Registry,
//! };
//!
//! let mut registry = Registry::new();
//! registry.register_numeric_pid(0x01, 0x0C, "rpm").unwrap();
//!
//! let mut engine = Engine::new(
//!     registry,
//!     EngineSettings::default(),
//!     RecordingTransport::new(),
//!     RecordingSink::new(),
//! );
//! engine.handle_event(LinkEvent::Connected);
//! engine.handle_event(LinkEvent::ReadyForTraffic);
//! engine.tick(Instant::now());
//! assert_eq!(engine.transport().last(), Some("ATZ\r"));
//! ```

mod classify;
mod config;
mod decode;
mod descriptor;
pub mod emulator;
mod engine;
mod error;
mod framer;
mod init;
mod normalize;
mod presets;
mod scheduler;
mod session;
mod sink;
mod transport;

pub use classify::{classify, ReplyClass};
pub use config::{
    BinarySensorsConfig, HubConfig, LogLevel, RawPidConfig, SensorConfig, TextSensorsConfig,
};
pub use decode::{
    decode_dtc, decode_dtc_list, parse_mode01, parse_voltage, pid_value, Mode01Reply, NO_FAULTS,
    RPM_PID,
};
pub use descriptor::{
    DescriptorKind, EcuHeader, QueryDescriptor, Registry, WireCommand, MAX_COMMAND_LEN,
    VOLTAGE_COMMAND,
};
pub use engine::{Engine, EngineSettings};
pub use error::{ConfigError, EngineError, TransportError};
pub use framer::ResponseFramer;
pub use init::{InitStep, INIT_SEQUENCE};
pub use normalize::normalize;
pub use presets::{PidPreset, PresetInfo, PresetQuery};
pub use session::{HeaderSwitchStep, Session, SessionState};
pub use sink::{Publication, RecordingSink, SinkId, ValueSink};
pub use transport::{LinkEvent, RecordingTransport, Transport};
