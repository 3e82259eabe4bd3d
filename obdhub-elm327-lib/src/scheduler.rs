//! Round-robin polling decisions.
//!
//! These functions only decide; the engine owns the session and performs
//! the sends.

use std::time::{Duration, Instant};

use crate::descriptor::{EcuHeader, QueryDescriptor, Registry};

/// What a Ready tick should do about the request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyDecision {
    /// Interval elapsed and nothing is outstanding
    RequestNext,
    /// The outstanding request took longer than the timeout
    TimedOut,
    Nothing,
}

pub fn ready_tick(
    waiting: bool,
    last_request: Option<Instant>,
    interval: Duration,
    timeout: Duration,
    now: Instant,
) -> ReadyDecision {
    let elapsed = last_request.map(|at| now.saturating_duration_since(at));
    if waiting {
        match elapsed {
            Some(elapsed) if elapsed >= timeout => ReadyDecision::TimedOut,
            _ => ReadyDecision::Nothing,
        }
    } else {
        match elapsed {
            Some(elapsed) if elapsed < interval => ReadyDecision::Nothing,
            _ => ReadyDecision::RequestNext,
        }
    }
}

/// The next step of the poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollAction<'a> {
    /// Registry is empty
    Idle,
    /// The due descriptor needs another header first; the index stays put
    SwitchHeader(EcuHeader),
    /// Send `descriptor`, then move on to `next_index`
    Send {
        index: usize,
        next_index: usize,
        descriptor: &'a QueryDescriptor,
    },
}

pub fn next_action<'a>(
    registry: &'a Registry,
    poll_index: usize,
    total_poll_count: usize,
    current_header: &EcuHeader,
) -> PollAction<'a> {
    if total_poll_count == 0 {
        return PollAction::Idle;
    }
    let index = poll_index % total_poll_count;
    let Some(descriptor) = registry.get(index) else {
        return PollAction::Idle;
    };
    let needed = descriptor.header();
    if &needed != current_header {
        return PollAction::SwitchHeader(needed);
    }
    PollAction::Send {
        index,
        next_index: (index + 1) % total_poll_count,
        descriptor,
    }
}
