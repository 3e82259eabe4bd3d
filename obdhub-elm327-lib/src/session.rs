//! Runtime state of one adapter session.

use std::time::Instant;

use derive_more::Display;

use crate::descriptor::EcuHeader;
use crate::framer::ResponseFramer;

/// Where the engine is in the adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum SessionState {
    #[default]
    #[display("disconnected")]
    Disconnected,
    #[display("connected")]
    Connected,
    #[display("initializing")]
    Initializing,
    #[display("ready")]
    Ready,
    #[display("switching header")]
    SwitchingHeader,
}

/// Progress of an `ATSH` sub-sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderSwitchStep {
    /// `ATSH` not sent yet
    #[default]
    Pending,
    /// `ATSH` sent, waiting for the adapter to settle
    Settling,
}

#[derive(Debug, Default)]
pub struct Session {
    pub state: SessionState,
    pub poll_index: usize,
    /// Registry length, fixed when initialization completes
    pub total_poll_count: usize,
    pub current_header: EcuHeader,
    pub pending_header: EcuHeader,
    pub header_step: HeaderSwitchStep,
    pub framer: ResponseFramer,
    pub waiting_for_response: bool,
    pub last_request: Option<Instant>,
    pub last_header_step: Option<Instant>,
    /// Index of the next init step to send; `None` before the first send
    pub init_step: Option<usize>,
    pub last_init_send: Option<Instant>,
    pub handles_resolved: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything tied to the current link.
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.poll_index = 0;
        self.total_poll_count = 0;
        self.last_request = None;
        self.last_header_step = None;
        self.framer.clear();
        self.handles_resolved = false;
        self.current_header = EcuHeader::broadcast();
        self.pending_header = EcuHeader::broadcast();
        self.header_step = HeaderSwitchStep::Pending;
        self.waiting_for_response = false;
        self.init_step = None;
        self.last_init_send = None;
    }

    /// Forget any in-flight request.
    pub fn abandon_request(&mut self) {
        self.waiting_for_response = false;
        self.framer.clear();
    }
}
