//! Query descriptors and the registry that orders them for polling.

use std::fmt;

use derive_more::Display;
use log::debug;

use crate::error::ConfigError;
use crate::sink::SinkId;

/// Largest command that fits in one write (default BLE ATT payload).
pub const MAX_COMMAND_LEN: usize = 20;

/// Functional broadcast address for 11-bit CAN.
pub const BROADCAST_HEADER: &str = "7DF";

/// Mode 03 request.
pub const DTC_COMMAND: &str = "03\r";

/// Battery voltage as measured at the adapter's supply pin.
pub const VOLTAGE_COMMAND: &str = "ATRV\r";

/// Offset between a request mode and its positive response byte.
pub const RESPONSE_MODE_OFFSET: u8 = 0x40;

/// Render a PID the way the adapter expects it: two hex digits for classic
/// PIDs, four for extended (Mode 22) ones.
fn pid_hex(pid: u16) -> String {
    if pid <= 0xFF {
        format!("{pid:02X}")
    } else {
        format!("{pid:04X}")
    }
}

/// A complete, `\r`-terminated command as written to the adapter.
///
/// Immutable once built; construction enforces the single-write limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireCommand(String);

impl WireCommand {
    /// Build a command from free text, appending the terminator if missing.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyCommand`] for blank input and
    /// [`ConfigError::CommandTooLong`] when it would not fit in one write.
    pub fn new(command: &str) -> Result<Self, ConfigError> {
        let body = command.trim_end_matches(|c| c == '\r' || c == '\n');
        if body.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        let rendered = format!("{body}\r");
        if rendered.len() > MAX_COMMAND_LEN {
            return Err(ConfigError::CommandTooLong {
                len: rendered.len(),
                command: rendered,
                limit: MAX_COMMAND_LEN,
            });
        }
        Ok(Self(rendered))
    }

    /// Build `<mode><pid>\r`, e.g. `0105\r` or `220101\r`.
    ///
    /// # Errors
    ///
    /// Same as [`WireCommand::new`].
    pub fn pid(mode: u8, pid: u16) -> Result<Self, ConfigError> {
        Self::new(&format!("{mode:02X}{}", pid_hex(pid)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The command without its terminator
    pub fn body(&self) -> &str {
        self.0.trim_end_matches('\r')
    }
}

impl fmt::Display for WireCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.body())
    }
}

/// ECU header a query must be sent under. Empty means broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EcuHeader(String);

impl EcuHeader {
    pub fn broadcast() -> Self {
        Self::default()
    }

    /// Uppercases the header; the literal broadcast address maps to broadcast.
    pub fn new(header: &str) -> Self {
        let header = header.trim().to_ascii_uppercase();
        if header == BROADCAST_HEADER {
            Self::default()
        } else {
            Self(header)
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_empty()
    }

    /// Internal representation, `""` for broadcast
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address as it goes on the wire
    pub fn wire_address(&self) -> &str {
        if self.is_broadcast() {
            BROADCAST_HEADER
        } else {
            &self.0
        }
    }

    /// `ATSH<address>\r`
    pub fn switch_command(&self) -> String {
        format!("ATSH{}\r", self.wire_address())
    }
}

impl fmt::Display for EcuHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("broadcast")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Descriptor kinds in polling-group order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum DescriptorKind {
    #[display("pid")]
    NumericPid,
    #[display("raw-pid")]
    RawTextPid,
    #[display("dtc")]
    Dtc,
    #[display("at")]
    AtCommand,
}

/// One configured thing to poll.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryDescriptor {
    /// Live value decoded with a per-PID formula
    NumericPid {
        mode: u8,
        pid: u16,
        command: WireCommand,
        sink: SinkId,
    },
    /// Adapter-level query such as `ATRV`
    AtCommand { command: WireCommand, sink: SinkId },
    /// Reply published verbatim as hex text, matched by prefix
    RawTextPid {
        mode: u8,
        pid: u16,
        header: EcuHeader,
        command: WireCommand,
        expected_prefix: String,
        sink: SinkId,
    },
    /// Stored trouble codes (Mode 03)
    Dtc { command: WireCommand, sink: SinkId },
}

impl QueryDescriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Self::NumericPid { .. } => DescriptorKind::NumericPid,
            Self::AtCommand { .. } => DescriptorKind::AtCommand,
            Self::RawTextPid { .. } => DescriptorKind::RawTextPid,
            Self::Dtc { .. } => DescriptorKind::Dtc,
        }
    }

    pub fn command(&self) -> &WireCommand {
        match self {
            Self::NumericPid { command, .. }
            | Self::AtCommand { command, .. }
            | Self::RawTextPid { command, .. }
            | Self::Dtc { command, .. } => command,
        }
    }

    pub fn sink(&self) -> &SinkId {
        match self {
            Self::NumericPid { sink, .. }
            | Self::AtCommand { sink, .. }
            | Self::RawTextPid { sink, .. }
            | Self::Dtc { sink, .. } => sink,
        }
    }

    /// Header this query has to go out under
    pub fn header(&self) -> EcuHeader {
        match self {
            Self::RawTextPid { header, .. } => header.clone(),
            _ => EcuHeader::broadcast(),
        }
    }
}

/// Expected reply prefix for a literal command: its mode byte plus 0x40,
/// followed by the rest of the command. Empty when the command does not
/// start with a request mode.
fn prefix_for_command(body: &str) -> String {
    let Some(mode) = body.get(..2).and_then(|m| u8::from_str_radix(m, 16).ok()) else {
        return String::new();
    };
    if mode == 0 || mode >= RESPONSE_MODE_OFFSET {
        return String::new();
    }
    format!(
        "{:02X}{}",
        mode + RESPONSE_MODE_OFFSET,
        body.get(2..).unwrap_or_default()
    )
}

fn check_mode(mode: u8, sink: &SinkId) -> Result<(), ConfigError> {
    if mode == 0 || mode >= RESPONSE_MODE_OFFSET {
        return Err(ConfigError::InvalidMode {
            id: sink.to_string(),
            mode,
        });
    }
    Ok(())
}

/// The ordered set of queries plus the single-slot sinks.
///
/// Polling order is numeric PIDs, raw-text PIDs, the DTC query, then AT
/// commands; registration order within each group.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: Vec<QueryDescriptor>,
    raw_reply_sink: Option<SinkId>,
    engine_running_sink: Option<SinkId>,
    link_ready_sink: Option<SinkId>,
    connection_switch_sink: Option<SinkId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, descriptor: QueryDescriptor) {
        let kind = descriptor.kind();
        let pos = self
            .descriptors
            .iter()
            .position(|d| d.kind() > kind)
            .unwrap_or(self.descriptors.len());
        self.descriptors.insert(pos, descriptor);
    }

    /// Register a numeric PID, e.g. mode 0x01 PID 0x05 polls `0105\r`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid mode or a command that does not fit one write.
    pub fn register_numeric_pid(
        &mut self,
        mode: u8,
        pid: u16,
        sink: impl Into<SinkId>,
    ) -> Result<(), ConfigError> {
        let sink = sink.into();
        check_mode(mode, &sink)?;
        let command = WireCommand::pid(mode, pid)?;
        debug!("PID sensor registered: mode 0x{mode:02X} PID 0x{pid:04X} -> {command}");
        self.insert(QueryDescriptor::NumericPid {
            mode,
            pid,
            command,
            sink,
        });
        Ok(())
    }

    /// Register an adapter command whose reply is decoded as a number.
    ///
    /// # Errors
    ///
    /// Fails on an empty or oversized command.
    pub fn register_at_command(
        &mut self,
        command: &str,
        sink: impl Into<SinkId>,
    ) -> Result<(), ConfigError> {
        let command = WireCommand::new(command)?;
        debug!("AT sensor registered: {command}");
        self.insert(QueryDescriptor::AtCommand {
            command,
            sink: sink.into(),
        });
        Ok(())
    }

    /// Register a PID whose reply is published as hex text.
    ///
    /// With `command` set, that literal command is polled instead of the one
    /// synthesized from `mode`/`pid`, and the reply prefix is derived from it.
    ///
    /// # Errors
    ///
    /// Fails on an invalid mode, an oversized command or an oversized header.
    pub fn register_raw_text_pid(
        &mut self,
        mode: u8,
        pid: u16,
        header: &str,
        command: Option<&str>,
        sink: impl Into<SinkId>,
    ) -> Result<(), ConfigError> {
        let sink = sink.into();
        let header = EcuHeader::new(header);
        let switch = header.switch_command();
        if switch.len() > MAX_COMMAND_LEN {
            return Err(ConfigError::CommandTooLong {
                len: switch.len(),
                command: switch,
                limit: MAX_COMMAND_LEN,
            });
        }

        let (command, expected_prefix) = match command.filter(|c| !c.trim().is_empty()) {
            Some(literal) => {
                let command = WireCommand::new(literal)?;
                let prefix = prefix_for_command(command.body());
                (command, prefix)
            }
            None => {
                check_mode(mode, &sink)?;
                let command = WireCommand::pid(mode, pid)?;
                let prefix = format!("{:02X}{}", mode + RESPONSE_MODE_OFFSET, pid_hex(pid));
                (command, prefix)
            }
        };

        debug!("Raw PID sensor registered: cmd={command} header={header} prefix={expected_prefix}");
        self.insert(QueryDescriptor::RawTextPid {
            mode,
            pid,
            header,
            command,
            expected_prefix,
            sink,
        });
        Ok(())
    }

    /// Register the DTC sink. There is one slot; a second call replaces it.
    pub fn register_dtc_sink(&mut self, sink: impl Into<SinkId>) {
        let sink = sink.into();
        if let Some(QueryDescriptor::Dtc { sink: slot, .. }) = self
            .descriptors
            .iter_mut()
            .find(|d| d.kind() == DescriptorKind::Dtc)
        {
            *slot = sink;
            return;
        }
        self.insert(QueryDescriptor::Dtc {
            command: WireCommand(DTC_COMMAND.to_string()),
            sink,
        });
    }

    /// Sink that receives every normalized reply
    pub fn register_raw_reply_sink(&mut self, sink: impl Into<SinkId>) {
        self.raw_reply_sink = Some(sink.into());
    }

    /// Sink for the boolean derived from RPM
    pub fn register_engine_running_sink(&mut self, sink: impl Into<SinkId>) {
        self.engine_running_sink = Some(sink.into());
    }

    /// Sink that goes true once the adapter is initialized
    pub fn register_link_ready_sink(&mut self, sink: impl Into<SinkId>) {
        self.link_ready_sink = Some(sink.into());
    }

    /// Sink mirroring the enable/disable control
    pub fn register_connection_switch_sink(&mut self, sink: impl Into<SinkId>) {
        self.connection_switch_sink = Some(sink.into());
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QueryDescriptor> {
        self.descriptors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.descriptors.iter()
    }

    /// Number of descriptors of one kind
    pub fn count(&self, kind: DescriptorKind) -> usize {
        self.descriptors.iter().filter(|d| d.kind() == kind).count()
    }

    /// First numeric sink registered for `pid`
    pub fn find_numeric_sink(&self, pid: u8) -> Option<&SinkId> {
        self.descriptors.iter().find_map(|d| match d {
            QueryDescriptor::NumericPid { pid: p, sink, .. } if *p == u16::from(pid) => Some(sink),
            _ => None,
        })
    }

    /// Sink of the AT descriptor whose command is exactly `command`
    pub fn find_at_sink(&self, command: &str) -> Option<&SinkId> {
        self.descriptors.iter().find_map(|d| match d {
            QueryDescriptor::AtCommand { command: c, sink } if c.as_str() == command => Some(sink),
            _ => None,
        })
    }

    /// `(expected_prefix, sink)` for every raw-text PID, in polling order
    pub fn raw_text_targets(&self) -> impl Iterator<Item = (&str, &SinkId)> {
        self.descriptors.iter().filter_map(|d| match d {
            QueryDescriptor::RawTextPid {
                expected_prefix,
                sink,
                ..
            } => Some((expected_prefix.as_str(), sink)),
            _ => None,
        })
    }

    pub fn dtc_sink(&self) -> Option<&SinkId> {
        self.descriptors.iter().find_map(|d| match d {
            QueryDescriptor::Dtc { sink, .. } => Some(sink),
            _ => None,
        })
    }

    pub fn raw_reply_sink(&self) -> Option<&SinkId> {
        self.raw_reply_sink.as_ref()
    }

    pub fn engine_running_sink(&self) -> Option<&SinkId> {
        self.engine_running_sink.as_ref()
    }

    pub fn link_ready_sink(&self) -> Option<&SinkId> {
        self.link_ready_sink.as_ref()
    }

    pub fn connection_switch_sink(&self) -> Option<&SinkId> {
        self.connection_switch_sink.as_ref()
    }
}
