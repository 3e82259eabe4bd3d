//! Timed AT initialization sequence.

use std::time::{Duration, Instant};

/// One command in the init sequence and how long to let the adapter settle
/// before sending the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitStep {
    pub command: &'static str,
    pub delay: Duration,
    pub description: &'static str,
}

const fn step(command: &'static str, delay_ms: u64, description: &'static str) -> InitStep {
    InitStep {
        command,
        delay: Duration::from_millis(delay_ms),
        description,
    }
}

pub const INIT_SEQUENCE: [InitStep; 9] = [
    step("ATZ\r", 2000, "reset"),
    step("ATE0\r", 500, "echo off"),
    step("ATL0\r", 500, "linefeeds off"),
    step("ATS0\r", 500, "spaces off"),
    step("ATH0\r", 500, "headers off"),
    step("ATAL\r", 500, "allow long messages"),
    step("ATSTFF\r", 500, "maximum frame timeout"),
    step("ATSP0\r", 1000, "protocol auto-detect"),
    step("0100\r", 5000, "protocol probe"),
];

/// What the sequencer wants done on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitAction {
    /// Send this step; it becomes the current one
    Send { index: usize, step: InitStep },
    /// Current step still settling
    Wait,
    /// Every step has been sent and settled
    Complete,
}

/// Decide the next init action.
///
/// `current` is the step last sent (`None` before the first send) and
/// `last_send` when it went out.
pub fn init_tick(current: Option<usize>, last_send: Option<Instant>, now: Instant) -> InitAction {
    let Some(index) = current else {
        return InitAction::Send {
            index: 0,
            step: INIT_SEQUENCE[0],
        };
    };
    let Some(step) = INIT_SEQUENCE.get(index) else {
        return InitAction::Complete;
    };
    let settled = last_send.map_or(true, |sent| now.saturating_duration_since(sent) >= step.delay);
    if !settled {
        return InitAction::Wait;
    }
    match INIT_SEQUENCE.get(index + 1) {
        Some(next) => InitAction::Send {
            index: index + 1,
            step: *next,
        },
        None => InitAction::Complete,
    }
}
