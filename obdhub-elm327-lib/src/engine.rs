//! The polling engine: session state machine plus reply dispatch.

use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::classify::{classify, is_adapter_error, is_at_ack, ReplyClass};
use crate::decode::{
    decode_dtc_list, format_dtc_list, match_raw_prefix, parse_mode01, parse_voltage, RawMatch,
    NO_FAULTS, RAW_MIN_PAYLOAD, RPM_PID,
};
use crate::descriptor::{
    DescriptorKind, EcuHeader, QueryDescriptor, Registry, WireCommand, VOLTAGE_COMMAND,
};
use crate::error::{EngineError, TransportError};
use crate::init::{init_tick, InitAction, INIT_SEQUENCE};
use crate::normalize::normalize;
use crate::scheduler::{next_action, ready_tick, PollAction, ReadyDecision};
use crate::session::{HeaderSwitchStep, Session, SessionState};
use crate::sink::{SinkId, ValueSink};
use crate::transport::{LinkEvent, Transport};

/// Timing and text knobs of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub request_interval: Duration,
    pub request_timeout: Duration,
    /// How long to let the adapter settle after `ATSH`
    pub header_settle: Duration,
    pub no_faults_text: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(10000),
            header_settle: Duration::from_millis(500),
            no_faults_text: NO_FAULTS.to_string(),
        }
    }
}

fn publish_flag<S: ValueSink>(sink: &mut S, id: Option<&SinkId>, value: bool) {
    if let Some(id) = id {
        sink.publish_boolean(id, value);
    }
}

/// Drives one adapter over a [`Transport`] and publishes into a [`ValueSink`].
///
/// Nothing here blocks: link events go through [`Engine::handle_event`] and
/// time advances through [`Engine::tick`].
#[derive(Debug)]
pub struct Engine<T, S> {
    transport: T,
    sink: S,
    registry: Registry,
    settings: EngineSettings,
    session: Session,
    enabled: bool,
}

impl<T: Transport, S: ValueSink> Engine<T, S> {
    pub fn new(registry: Registry, settings: EngineSettings, transport: T, sink: S) -> Self {
        Self {
            transport,
            sink,
            registry,
            settings,
            session: Session::new(),
            enabled: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feed a link event from the transport.
    pub fn handle_event(&mut self, event: LinkEvent<'_>) {
        match event {
            LinkEvent::Connected => {
                if !self.enabled {
                    debug!("Ignoring connect while disabled");
                    return;
                }
                info!("Link connected");
                self.session.reset();
                self.session.state = SessionState::Connected;
                publish_flag(&mut self.sink, self.registry.link_ready_sink(), false);
            }
            LinkEvent::ReadyForTraffic => {
                if self.session.state == SessionState::Disconnected {
                    debug!("Ignoring ready-for-traffic while disconnected");
                    return;
                }
                info!("Link ready, starting adapter initialization");
                self.session.handles_resolved = true;
                self.session.state = SessionState::Initializing;
                self.session.init_step = None;
                self.session.last_init_send = None;
            }
            LinkEvent::Notification(chunk) => {
                if self.session.state == SessionState::Disconnected {
                    trace!("Dropping {} bytes received while disconnected", chunk.len());
                    return;
                }
                trace!("Received (raw): {}", String::from_utf8_lossy(chunk).escape_debug());
                if let Some(reply) = self.session.framer.push(chunk) {
                    self.process_reply(&reply);
                }
            }
            LinkEvent::Disconnected => {
                warn!("Link lost");
                self.session.reset();
                publish_flag(&mut self.sink, self.registry.link_ready_sink(), false);
                publish_flag(
                    &mut self.sink,
                    self.registry.connection_switch_sink(),
                    self.enabled,
                );
            }
        }
    }

    /// Advance timers. Call regularly with a monotonic `now`.
    pub fn tick(&mut self, now: Instant) {
        match self.session.state {
            SessionState::Initializing => self.run_init(now),
            SessionState::SwitchingHeader => self.run_header_switch(now),
            SessionState::Ready => self.run_ready(now),
            SessionState::Disconnected | SessionState::Connected => {}
        }
    }

    /// Enable or disable the engine. Disabling drops the session and makes
    /// the engine ignore connects until re-enabled.
    pub fn set_enabled(&mut self, enabled: bool) {
        info!("Adapter connection {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        if !enabled {
            self.session.reset();
            publish_flag(&mut self.sink, self.registry.link_ready_sink(), false);
        }
        publish_flag(&mut self.sink, self.registry.connection_switch_sink(), enabled);
    }

    /// Send an ad-hoc command outside the poll cycle. Its reply goes through
    /// the normal classifier.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotReady`] before initialization completes, a
    /// configuration error for an unusable command, or the transport's error.
    pub fn send_custom_command(&mut self, command: &str) -> Result<(), EngineError> {
        let state = self.session.state;
        if !matches!(state, SessionState::Ready | SessionState::SwitchingHeader) {
            warn!("Adapter not ready, ignoring command: {command}");
            return Err(EngineError::NotReady { state });
        }
        let command = WireCommand::new(command)?;
        info!("Custom command: {command}");
        self.session.framer.clear();
        self.transport.send(command.as_bytes())?;
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("ELM327 hub:");
        info!("  Request interval: {} ms", self.settings.request_interval.as_millis());
        info!("  Request timeout: {} ms", self.settings.request_timeout.as_millis());
        info!("  Header settle: {} ms", self.settings.header_settle.as_millis());
        info!(
            "  PID sensors: {}",
            self.registry.count(DescriptorKind::NumericPid)
        );
        info!(
            "  AT sensors: {}",
            self.registry.count(DescriptorKind::AtCommand)
        );
        info!(
            "  Raw PID sensors: {}",
            self.registry.count(DescriptorKind::RawTextPid)
        );
        if let Some(id) = self.registry.dtc_sink() {
            info!("  DTC sensor: {id}");
        }
        for descriptor in self.registry.iter() {
            if let QueryDescriptor::RawTextPid {
                command,
                header,
                expected_prefix,
                ..
            } = descriptor
            {
                info!("  Raw PID: cmd={command} header={header} prefix={expected_prefix}");
            }
        }
        let slots = [
            ("Raw reply", self.registry.raw_reply_sink()),
            ("Engine running", self.registry.engine_running_sink()),
            ("Link ready", self.registry.link_ready_sink()),
            ("Connection switch", self.registry.connection_switch_sink()),
        ];
        for (label, id) in slots {
            if let Some(id) = id {
                info!("  {label} sensor: {id}");
            }
        }
    }

    /// Write a control command (init step, `ATSH`). Failures are logged only.
    fn transmit(&mut self, command: &str) {
        let result = if self.session.handles_resolved {
            self.transport.send(command.as_bytes())
        } else {
            Err(TransportError::NotReady)
        };
        if let Err(err) = result {
            warn!("Cannot send {}: {err}", command.trim_end());
        }
    }

    fn run_init(&mut self, now: Instant) {
        match init_tick(self.session.init_step, self.session.last_init_send, now) {
            InitAction::Send { index, step } => {
                debug!(
                    "Init [{}/{}]: {}",
                    index + 1,
                    INIT_SEQUENCE.len(),
                    step.description
                );
                self.transmit(step.command);
                self.session.init_step = Some(index);
                self.session.last_init_send = Some(now);
            }
            InitAction::Wait => {}
            InitAction::Complete => self.finish_init(),
        }
    }

    fn finish_init(&mut self) {
        info!("ELM327 initialized, ready for polling");
        self.session.state = SessionState::Ready;
        self.session.poll_index = 0;
        self.session.total_poll_count = self.registry.len();
        self.session.current_header = EcuHeader::broadcast();
        self.session.last_request = None;
        self.session.abandon_request();
        publish_flag(&mut self.sink, self.registry.link_ready_sink(), true);
        publish_flag(&mut self.sink, self.registry.connection_switch_sink(), true);
    }

    fn run_header_switch(&mut self, now: Instant) {
        match self.session.header_step {
            HeaderSwitchStep::Pending => {
                let command = self.session.pending_header.switch_command();
                debug!("Header switch: {}", command.trim_end());
                self.transmit(&command);
                self.session.header_step = HeaderSwitchStep::Settling;
                self.session.last_header_step = Some(now);
            }
            HeaderSwitchStep::Settling => {
                let settled = self.session.last_header_step.map_or(true, |at| {
                    now.saturating_duration_since(at) >= self.settings.header_settle
                });
                if !settled {
                    return;
                }
                self.session.current_header = std::mem::take(&mut self.session.pending_header);
                debug!("Header set to {}", self.session.current_header);
                self.session.header_step = HeaderSwitchStep::Pending;
                self.session.state = SessionState::Ready;
                self.session.abandon_request();
                self.request_next(now);
            }
        }
    }

    fn run_ready(&mut self, now: Instant) {
        let decision = ready_tick(
            self.session.waiting_for_response,
            self.session.last_request,
            self.settings.request_interval,
            self.settings.request_timeout,
            now,
        );
        match decision {
            ReadyDecision::RequestNext => self.request_next(now),
            ReadyDecision::TimedOut => {
                warn!(
                    "Timeout after {} ms, no reply",
                    self.settings.request_timeout.as_millis()
                );
                self.session.abandon_request();
            }
            ReadyDecision::Nothing => {}
        }
    }

    fn request_next(&mut self, now: Instant) {
        let total = self.session.total_poll_count;
        let action = next_action(
            &self.registry,
            self.session.poll_index,
            total,
            &self.session.current_header,
        );
        match action {
            PollAction::Idle => {}
            PollAction::SwitchHeader(target) => {
                debug!(
                    "Header switch needed: {} -> {target}",
                    self.session.current_header
                );
                self.session.pending_header = target;
                self.session.header_step = HeaderSwitchStep::Pending;
                self.session.last_header_step = Some(now);
                self.session.state = SessionState::SwitchingHeader;
            }
            PollAction::Send {
                index,
                next_index,
                descriptor,
            } => {
                match descriptor {
                    QueryDescriptor::Dtc { .. } => info!(">> [{}/{total}] DTC query", index + 1),
                    QueryDescriptor::RawTextPid { header, command, .. }
                        if !header.is_broadcast() =>
                    {
                        info!(">> [{}/{total}] {command} (ECU {header})", index + 1);
                    }
                    _ => info!(">> [{}/{total}] {}", index + 1, descriptor.command()),
                }

                self.session.framer.clear();
                self.session.waiting_for_response = true;
                self.session.last_request = Some(now);
                if let Err(err) = self.transport.send(descriptor.command().as_bytes()) {
                    warn!("Request dropped, write failed: {err}");
                    self.session.waiting_for_response = false;
                }
                self.session.poll_index = next_index;
            }
        }
    }

    fn process_reply(&mut self, reply: &[u8]) {
        self.session.waiting_for_response = false;
        let clean = normalize(reply);
        info!("<< {clean}");

        if let Some(id) = self.registry.raw_reply_sink() {
            self.sink.publish_text(id, &clean);
        }

        if matches!(
            self.session.state,
            SessionState::Initializing | SessionState::SwitchingHeader
        ) {
            return;
        }
        if is_adapter_error(&clean) {
            warn!("Adapter error or no data: {clean}");
            return;
        }
        if is_at_ack(&clean) {
            return;
        }

        let raw_matched = self.dispatch_raw(&clean);

        match classify(&clean) {
            ReplyClass::Dtc => self.publish_dtcs(&clean),
            ReplyClass::Voltage => self.publish_voltage(&clean),
            ReplyClass::Mode01 => self.publish_mode01(&clean),
            ReplyClass::ExtendedData if !raw_matched => {
                warn!("Mode 22 reply without matching sensor: {clean}");
            }
            _ => {}
        }
    }

    /// Publish to every raw-text PID whose prefix occurs in the reply.
    /// Returns whether any prefix matched, truncated hits included.
    fn dispatch_raw(&mut self, clean: &str) -> bool {
        let mut matched = false;
        for (prefix, id) in self.registry.raw_text_targets() {
            match match_raw_prefix(clean, prefix) {
                RawMatch::Miss => {}
                RawMatch::Truncated(data) => {
                    warn!(
                        "Reply too short ({} chars, expected at least {}): {data}",
                        data.len(),
                        prefix.len() + RAW_MIN_PAYLOAD
                    );
                    matched = true;
                }
                RawMatch::Payload(data) => {
                    trace!("Raw PID match [{prefix}]");
                    self.sink.publish_text(id, data);
                    matched = true;
                }
            }
        }
        matched
    }

    fn publish_mode01(&mut self, clean: &str) {
        let Some(reply) = parse_mode01(clean) else {
            debug!("Malformed Mode 01 reply: {clean}");
            return;
        };
        let Some(id) = self.registry.find_numeric_sink(reply.pid) else {
            debug!("No sensor registered for PID 0x{:02X}", reply.pid);
            return;
        };
        let value = reply.value();
        self.sink.publish_numeric(id, value);
        debug!("PID 0x{:02X} = {value:.2}", reply.pid);

        if reply.pid == RPM_PID {
            publish_flag(
                &mut self.sink,
                self.registry.engine_running_sink(),
                value > 0.0,
            );
        }
    }

    fn publish_dtcs(&mut self, clean: &str) {
        let Some(id) = self.registry.dtc_sink() else {
            return;
        };
        let Some(codes) = decode_dtc_list(clean) else {
            return;
        };
        let text = format_dtc_list(&codes, &self.settings.no_faults_text);
        self.sink.publish_text(id, &text);
        debug!("DTCs ({}): {text}", codes.len());
    }

    fn publish_voltage(&mut self, clean: &str) {
        let Some(id) = self.registry.find_at_sink(VOLTAGE_COMMAND) else {
            return;
        };
        if let Some(volts) = parse_voltage(clean) {
            self.sink.publish_numeric(id, volts);
            debug!("Battery: {volts:.1} V");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{Elm327Emulator, ExtendedRecord, LoopbackTransport, Vehicle};
    use crate::sink::RecordingSink;
    use crate::transport::RecordingTransport;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Total time the init sequence takes to run to completion
    fn init_duration() -> Duration {
        INIT_SEQUENCE.iter().map(|s| s.delay).sum()
    }

    fn basic_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_numeric_pid(0x01, 0x0C, "rpm").unwrap();
        registry.register_numeric_pid(0x01, 0x05, "coolant").unwrap();
        registry.register_at_command("ATRV", "battery").unwrap();
        registry.register_dtc_sink("dtc");
        registry.register_raw_reply_sink("raw");
        registry.register_engine_running_sink("running");
        registry.register_link_ready_sink("link");
        registry.register_connection_switch_sink("switch");
        registry
    }

    fn header_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_numeric_pid(0x01, 0x0C, "rpm").unwrap();
        registry
            .register_raw_text_pid(0x22, 0x0101, "7E4", None, "bms")
            .unwrap();
        registry.register_at_command("ATRV", "battery").unwrap();
        registry
    }

    type TestEngine = Engine<RecordingTransport, RecordingSink>;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn engine(registry: Registry) -> TestEngine {
        init_logging();
        Engine::new(
            registry,
            EngineSettings::default(),
            RecordingTransport::new(),
            RecordingSink::new(),
        )
    }

    /// Connect and run the init sequence to completion; returns the time
    /// at which the engine became Ready.
    fn bring_up<T: Transport>(engine: &mut Engine<T, RecordingSink>, t0: Instant) -> Instant {
        engine.handle_event(LinkEvent::Connected);
        engine.handle_event(LinkEvent::ReadyForTraffic);
        let mut now = t0;
        let end = t0 + init_duration() + ms(100);
        while now <= end && engine.state() == SessionState::Initializing {
            engine.tick(now);
            now += ms(100);
        }
        assert_eq!(engine.state(), SessionState::Ready);
        now
    }

    fn deliver<T: Transport>(engine: &mut Engine<T, RecordingSink>, reply: &[u8]) {
        engine.handle_event(LinkEvent::Notification(reply));
    }

    #[test]
    fn test_connect_sequence() {
        let mut engine = engine(basic_registry());
        assert_eq!(engine.state(), SessionState::Disconnected);

        engine.handle_event(LinkEvent::Connected);
        assert_eq!(engine.state(), SessionState::Connected);
        assert_eq!(engine.sink().last_boolean("link"), Some(false));

        engine.tick(Instant::now());
        assert!(engine.transport().sent.is_empty());

        engine.handle_event(LinkEvent::ReadyForTraffic);
        assert_eq!(engine.state(), SessionState::Initializing);
        assert!(engine.session().handles_resolved);
    }

    #[test]
    fn test_ready_for_traffic_ignored_when_disconnected() {
        let mut engine = engine(basic_registry());
        engine.handle_event(LinkEvent::ReadyForTraffic);
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_init_sends_all_steps_in_order() {
        let mut engine = engine(basic_registry());
        bring_up(&mut engine, Instant::now());

        let expected: Vec<&str> = INIT_SEQUENCE.iter().map(|s| s.command).collect();
        assert_eq!(engine.transport().sent, expected);
        assert_eq!(engine.session().total_poll_count, 4);
        assert_eq!(engine.sink().last_boolean("link"), Some(true));
        assert_eq!(engine.sink().last_boolean("switch"), Some(true));
    }

    #[test]
    fn test_replies_during_init_only_reach_raw_sink() {
        let mut engine = engine(basic_registry());
        engine.handle_event(LinkEvent::Connected);
        engine.handle_event(LinkEvent::ReadyForTraffic);
        engine.tick(Instant::now());
        deliver(&mut engine, b"410C1388\r\r>");

        assert_eq!(engine.sink().last_text("raw"), Some("410C1388"));
        assert_eq!(engine.sink().last_numeric("rpm"), None);
    }

    #[test]
    fn test_first_request_immediately_after_init() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.transport_mut().take();

        engine.tick(now);
        assert_eq!(engine.transport().last(), Some("010C\r"));
        assert!(engine.session().waiting_for_response);
        assert_eq!(engine.session().poll_index, 1);
    }

    #[test]
    fn test_rpm_reply_publishes_value_and_running_flag() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);

        deliver(&mut engine, b"41 0C 13");
        assert!(engine.session().waiting_for_response);
        deliver(&mut engine, b" 88\r\r>");

        assert!(!engine.session().waiting_for_response);
        assert_eq!(engine.sink().last_numeric("rpm"), Some(1250.0));
        assert_eq!(engine.sink().last_boolean("running"), Some(true));
        assert_eq!(engine.sink().last_text("raw"), Some("410C1388"));
    }

    #[test]
    fn test_engine_off_publishes_not_running() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"410C0000>");
        assert_eq!(engine.sink().last_numeric("rpm"), Some(0.0));
        assert_eq!(engine.sink().last_boolean("running"), Some(false));
    }

    #[test]
    fn test_round_robin_returns_to_start() {
        let mut engine = engine(basic_registry());
        let mut now = bring_up(&mut engine, Instant::now());
        engine.transport_mut().take();

        for _ in 0..8 {
            engine.tick(now);
            deliver(&mut engine, b"OK>");
            now += ms(2000);
        }
        assert_eq!(
            engine.transport().sent,
            ["010C\r", "0105\r", "03\r", "ATRV\r", "010C\r", "0105\r", "03\r", "ATRV\r"]
        );
        assert_eq!(engine.session().poll_index, 0);
    }

    #[test]
    fn test_interval_respected() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"410C1388>");
        engine.transport_mut().take();

        engine.tick(now + ms(1999));
        assert!(engine.transport().sent.is_empty());
        engine.tick(now + ms(2000));
        assert_eq!(engine.transport().last(), Some("0105\r"));
    }

    #[test]
    fn test_timeout_moves_on_without_publishing() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"41 0C");
        engine.sink_mut().clear();

        engine.tick(now + ms(9999));
        assert!(engine.session().waiting_for_response);

        engine.tick(now + ms(10000));
        assert!(!engine.session().waiting_for_response);
        assert!(engine.session().framer.is_empty());
        assert!(engine.sink().publications.is_empty());

        engine.tick(now + ms(12000));
        assert_eq!(engine.transport().last(), Some("0105\r"));
    }

    #[test]
    fn test_header_switch_then_request() {
        let mut engine = engine(header_registry());
        let mut now = bring_up(&mut engine, Instant::now());

        engine.tick(now);
        deliver(&mut engine, b"410C1388>");
        engine.transport_mut().take();

        now += ms(2000);
        engine.tick(now);
        assert_eq!(engine.state(), SessionState::SwitchingHeader);
        assert_eq!(engine.session().poll_index, 1);
        assert!(engine.transport().sent.is_empty());

        engine.tick(now);
        assert_eq!(engine.transport().last(), Some("ATSH7E4\r"));
        deliver(&mut engine, b"OK\r\r>");

        engine.tick(now + ms(499));
        assert_eq!(engine.transport().sent.len(), 1);

        engine.tick(now + ms(500));
        assert_eq!(engine.state(), SessionState::Ready);
        assert_eq!(engine.session().current_header, EcuHeader::new("7E4"));
        assert_eq!(engine.transport().sent, ["ATSH7E4\r", "220101\r"]);
        assert_eq!(engine.session().poll_index, 2);
    }

    #[test]
    fn test_switch_back_to_broadcast() {
        let mut engine = engine(header_registry());
        let mut now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"410C1388>");

        now += ms(2000);
        engine.tick(now);
        engine.tick(now);
        engine.tick(now + ms(500));
        deliver(&mut engine, b"620101EFFBE7ED95>");
        assert_eq!(engine.sink().last_text("bms"), Some("620101EFFBE7ED95"));
        engine.transport_mut().take();

        now += ms(2500);
        engine.tick(now);
        assert_eq!(engine.state(), SessionState::SwitchingHeader);
        engine.tick(now);
        assert_eq!(engine.transport().last(), Some("ATSH7DF\r"));
        engine.tick(now + ms(500));
        assert!(engine.session().current_header.is_broadcast());
        assert_eq!(engine.transport().sent, ["ATSH7DF\r", "ATRV\r"]);
    }

    #[test]
    fn test_reply_during_header_switch_discarded() {
        let mut engine = engine(header_registry());
        let mut now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"410C1388>");
        engine.sink_mut().clear();

        now += ms(2000);
        engine.tick(now);
        engine.tick(now);
        deliver(&mut engine, b"410C0000>");
        assert_eq!(engine.sink().last_numeric("rpm"), None);
    }

    #[test]
    fn test_dtc_and_voltage() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);

        deliver(&mut engine, b"43 01 01 41 23 00 00\r>");
        assert_eq!(engine.sink().last_text("dtc"), Some("P0101, C0123"));

        deliver(&mut engine, b"43 00 00 00 00 00 00\r>");
        assert_eq!(engine.sink().last_text("dtc"), Some("no faults"));

        deliver(&mut engine, b"25.0V\r>");
        assert_eq!(engine.sink().last_numeric("battery"), None);
        deliver(&mut engine, b"12.4V\r>");
        assert_eq!(engine.sink().last_numeric("battery"), Some(12.4));
    }

    #[test]
    fn test_custom_no_faults_text() {
        let settings = EngineSettings {
            no_faults_text: "Keine Fehler".to_string(),
            ..EngineSettings::default()
        };
        let mut engine = Engine::new(
            basic_registry(),
            settings,
            RecordingTransport::new(),
            RecordingSink::new(),
        );
        bring_up(&mut engine, Instant::now());
        deliver(&mut engine, b"4300>");
        assert_eq!(engine.sink().last_text("dtc"), Some("Keine Fehler"));
    }

    #[test]
    fn test_adapter_errors_and_acks_discarded() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        engine.sink_mut().clear();

        for reply in [&b"NO DATA\r>"[..], b"CAN ERROR 410C1388>", b"OK>", b"ATRV>"] {
            deliver(&mut engine, reply);
        }
        assert!(engine
            .sink()
            .publications
            .iter()
            .all(|p| p.sink().as_str() == "raw"));
    }

    #[test]
    fn test_unregistered_pid_ignored() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        engine.sink_mut().clear();
        deliver(&mut engine, b"410D28>");
        assert_eq!(engine.sink().publications.len(), 1);
    }

    #[test]
    fn test_raw_truncated_not_published() {
        let mut engine = engine(header_registry());
        bring_up(&mut engine, Instant::now());
        deliver(&mut engine, b"620101EF>");
        assert_eq!(engine.sink().last_text("bms"), None);
    }

    #[test]
    fn test_raw_and_mode01_both_fire() {
        let mut registry = header_registry();
        registry
            .register_raw_text_pid(0x01, 0x0C, "", None, "rpm-hex")
            .unwrap();
        let mut engine = engine(registry);
        bring_up(&mut engine, Instant::now());
        deliver(&mut engine, b"410C1388AABBCCDD>");
        assert_eq!(engine.sink().last_text("rpm-hex"), Some("410C1388AABBCCDD"));
        assert_eq!(engine.sink().last_numeric("rpm"), Some(1250.0));
    }

    #[test]
    fn test_overlapping_raw_prefixes_all_fire() {
        let mut registry = header_registry();
        registry
            .register_raw_text_pid(0x22, 0x0101, "", Some("2201"), "bms-page")
            .unwrap();
        let mut engine = engine(registry);
        bring_up(&mut engine, Instant::now());

        deliver(&mut engine, b"620101EFFBE7ED95>");
        assert_eq!(engine.sink().last_text("bms"), Some("620101EFFBE7ED95"));
        assert_eq!(engine.sink().last_text("bms-page"), Some("620101EFFBE7ED95"));
    }

    #[test]
    fn test_init_write_suppressed_without_link() {
        let mut engine = engine(basic_registry());
        engine.handle_event(LinkEvent::Connected);
        engine.handle_event(LinkEvent::ReadyForTraffic);
        engine.session.handles_resolved = false;

        engine.tick(Instant::now());
        assert!(engine.transport().sent.is_empty());
        assert_eq!(engine.session().init_step, Some(0));
    }

    #[test]
    fn test_notifications_dropped_while_disconnected() {
        let mut engine = engine(basic_registry());
        deliver(&mut engine, b"410C1388>");
        assert!(engine.sink().publications.is_empty());
        assert!(engine.session().framer.is_empty());
    }

    #[test]
    fn test_disconnect_resets_session() {
        let mut engine = engine(header_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.tick(now);
        deliver(&mut engine, b"41 0C");

        engine.handle_event(LinkEvent::Disconnected);
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(!engine.session().waiting_for_response);
        assert!(engine.session().framer.is_empty());
        assert!(!engine.session().handles_resolved);
        assert_eq!(engine.sink().last_boolean("link"), None);
        assert_eq!(engine.session().poll_index, 0);
        assert!(engine.session().last_request.is_none());

        engine.tick(now + ms(5000));
        assert_eq!(engine.transport().sent.len(), INIT_SEQUENCE.len() + 1);
    }

    #[test]
    fn test_disable_blocks_reconnect() {
        let mut engine = engine(basic_registry());
        bring_up(&mut engine, Instant::now());

        engine.set_enabled(false);
        assert!(!engine.is_enabled());
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert_eq!(engine.sink().last_boolean("link"), Some(false));
        assert_eq!(engine.sink().last_boolean("switch"), Some(false));

        engine.handle_event(LinkEvent::Connected);
        assert_eq!(engine.state(), SessionState::Disconnected);

        engine.set_enabled(true);
        assert_eq!(engine.sink().last_boolean("switch"), Some(true));
        engine.handle_event(LinkEvent::Connected);
        assert_eq!(engine.state(), SessionState::Connected);
    }

    #[test]
    fn test_custom_command() {
        let mut engine = engine(basic_registry());
        assert!(matches!(
            engine.send_custom_command("ATI"),
            Err(EngineError::NotReady {
                state: SessionState::Disconnected
            })
        ));

        bring_up(&mut engine, Instant::now());
        engine.transport_mut().take();
        engine.send_custom_command("ATI").unwrap();
        assert_eq!(engine.transport().last(), Some("ATI\r"));

        assert!(matches!(
            engine.send_custom_command(""),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_send_failure_clears_waiting() {
        let mut engine = engine(basic_registry());
        let now = bring_up(&mut engine, Instant::now());
        engine.transport_mut().fail_with = Some(TransportError::Disconnected);

        engine.tick(now);
        assert!(!engine.session().waiting_for_response);
        assert_eq!(engine.session().poll_index, 1);

        assert!(matches!(
            engine.send_custom_command("ATRV"),
            Err(EngineError::Transport(TransportError::Disconnected))
        ));
    }

    #[test]
    fn test_empty_registry_stays_idle() {
        let mut engine = engine(Registry::new());
        let now = bring_up(&mut engine, Instant::now());
        engine.transport_mut().take();
        engine.tick(now);
        engine.tick(now + ms(5000));
        assert!(engine.transport().sent.is_empty());
    }

    fn loopback_engine(vehicle: Vehicle) -> Engine<LoopbackTransport, RecordingSink> {
        let mut registry = header_registry();
        registry.register_numeric_pid(0x01, 0x05, "coolant").unwrap();
        registry.register_dtc_sink("dtc");
        registry.register_engine_running_sink("running");
        init_logging();
        Engine::new(
            registry,
            EngineSettings::default(),
            LoopbackTransport::new(Elm327Emulator::new(vehicle)),
            RecordingSink::new(),
        )
    }

    /// Tick every 50 ms and hand whatever the adapter printed back to the
    /// engine in 20-byte notifications.
    fn run_loopback(
        engine: &mut Engine<LoopbackTransport, RecordingSink>,
        t0: Instant,
        span: Duration,
    ) {
        let mut now = t0;
        while now <= t0 + span {
            engine.tick(now);
            let out = engine.transport_mut().take_pending();
            for chunk in out.chunks(20) {
                engine.handle_event(LinkEvent::Notification(chunk));
            }
            now += ms(50);
        }
    }

    #[test]
    fn test_end_to_end_with_emulator() {
        let vehicle = Vehicle {
            rpm: 1250.0,
            coolant_c: 90,
            dtcs: vec![0x0101],
            extended: vec![ExtendedRecord {
                header: EcuHeader::new("7E4"),
                pid: 0x0101,
                data: vec![0xEF, 0xFB, 0xE7, 0xED, 0x95, 0x00, 0x00, 0x11],
            }],
            ..Vehicle::default()
        };
        let mut engine = loopback_engine(vehicle);
        let t0 = Instant::now();
        engine.handle_event(LinkEvent::Connected);
        engine.handle_event(LinkEvent::ReadyForTraffic);

        run_loopback(&mut engine, t0, init_duration() + ms(15000));

        let sink = engine.sink();
        assert_eq!(sink.last_numeric("rpm"), Some(1250.0));
        assert_eq!(sink.last_boolean("running"), Some(true));
        assert_eq!(sink.last_numeric("coolant"), Some(90.0));
        assert_eq!(sink.last_numeric("battery"), Some(12.4));
        assert_eq!(sink.last_text("dtc"), Some("P0101"));
        assert_eq!(sink.last_text("bms"), Some("620101EFFBE7ED95000011"));

        let sent = &engine.transport().sent;
        let bms = sent.iter().position(|c| c == "220101\r").unwrap();
        assert_eq!(sent[bms - 1], "ATSH7E4\r");
        assert!(sent.iter().any(|c| c == "ATSH7DF\r"));
    }
}
