//! Error types shared by the engine, its configuration and the transport seam.

use derive_more::{Display, Error, From};

use crate::session::SessionState;

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransportError {
    /// The link exists but cannot carry traffic yet (handles unresolved)
    #[display("transport not ready")]
    NotReady,
    /// The single write did not go through
    #[display("write failed: {reason}")]
    WriteFailed { reason: String },
    /// The link went away underneath the write
    #[display("transport disconnected")]
    Disconnected,
}

impl TransportError {
    /// Wrap an I/O error from a byte-stream transport.
    pub fn write_failed(err: &std::io::Error) -> Self {
        Self::WriteFailed {
            reason: err.to_string(),
        }
    }
}

/// Errors raised while building a registry from configuration.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    /// The configuration file is not valid JSON for [`HubConfig`](crate::HubConfig)
    #[display("invalid configuration: {_0}")]
    Json(serde_json::Error),
    /// A wire command is longer than a single transport write
    #[display("command {command:?} is {len} bytes, limit is {limit}")]
    #[from(ignore)]
    CommandTooLong {
        command: String,
        len: usize,
        limit: usize,
    },
    /// A wire command has no content besides the terminator
    #[display("empty command")]
    #[from(ignore)]
    EmptyCommand,
    /// A sensor entry names neither a preset, a PID nor an AT command
    #[display("sensor {id:?} has no pid, at_command or type")]
    #[from(ignore)]
    MissingPid { id: String },
    /// A mode byte outside the OBD2 request range
    #[display("sensor {id:?} uses invalid mode 0x{mode:02X}")]
    #[from(ignore)]
    InvalidMode { id: String, mode: u8 },
}

/// Errors returned by the public [`Engine`](crate::Engine) operations.
#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    /// The operation needs an initialized adapter
    #[display("adapter not ready (state: {state})")]
    #[from(ignore)]
    NotReady { state: SessionState },
    /// The command could not be built
    #[display("{_0}")]
    Config(ConfigError),
    /// The transport rejected the write
    #[display("{_0}")]
    Transport(TransportError),
}
