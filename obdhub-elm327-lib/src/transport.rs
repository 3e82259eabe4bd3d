//! The transport seam.
//!
//! A transport only has to do two things for the engine: write bytes, and
//! report what happened on the link. Native callback shapes (GATT events, TCP
//! reads) are adapted to [`LinkEvent`] at the boundary.

use crate::error::TransportError;

/// Outgoing half of the link.
pub trait Transport {
    /// Best-effort single write of a complete command.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the bytes were not handed to the link.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Incoming half of the link, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent<'a> {
    /// Link established, characteristics not resolved yet
    Connected,
    /// Handles resolved and notifications subscribed
    ReadyForTraffic,
    /// A notification chunk of arbitrary size
    Notification(&'a [u8]),
    /// Link lost
    Disconnected,
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }
}

/// Transport that records every write, for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<String>,
    /// When set, every write fails with this error
    pub fail_with: Option<TransportError>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent command written
    pub fn last(&self) -> Option<&str> {
        self.sent.last().map(String::as_str)
    }

    /// Drain all recorded commands
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.sent.push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }
}
