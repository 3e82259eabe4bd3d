//! Value sinks: where decoded readings go.
//!
//! The engine never knows what a sink is backed by (a home automation entity,
//! a log line, a test recorder). It only knows the [`SinkId`] a descriptor
//! was registered with and calls the matching `publish_*` method.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifies one consumer-facing value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(String);

impl SinkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SinkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Receives decoded values from the engine.
pub trait ValueSink {
    fn publish_numeric(&mut self, id: &SinkId, value: f64);
    fn publish_text(&mut self, id: &SinkId, value: &str);
    fn publish_boolean(&mut self, id: &SinkId, value: bool);
}

/// A single value handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    Numeric(SinkId, f64),
    Text(SinkId, String),
    Boolean(SinkId, bool),
}

impl Publication {
    pub fn sink(&self) -> &SinkId {
        match self {
            Self::Numeric(id, _) | Self::Text(id, _) | Self::Boolean(id, _) => id,
        }
    }
}

/// Sink that keeps every publication in order.
///
/// Used by the tests and by tools that want to inspect what the engine
/// produced after the fact.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub publications: Vec<Publication>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent numeric value published to `id`
    pub fn last_numeric(&self, id: &str) -> Option<f64> {
        self.publications.iter().rev().find_map(|p| match p {
            Publication::Numeric(s, v) if s.as_str() == id => Some(*v),
            _ => None,
        })
    }

    /// Most recent text value published to `id`
    pub fn last_text<'a>(&'a self, id: &str) -> Option<&'a str> {
        self.publications.iter().rev().find_map(|p| match p {
            Publication::Text(s, v) if s.as_str() == id => Some(v.as_str()),
            _ => None,
        })
    }

    /// Most recent boolean value published to `id`
    pub fn last_boolean(&self, id: &str) -> Option<bool> {
        self.publications.iter().rev().find_map(|p| match p {
            Publication::Boolean(s, v) if s.as_str() == id => Some(*v),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.publications.clear();
    }
}

impl ValueSink for RecordingSink {
    fn publish_numeric(&mut self, id: &SinkId, value: f64) {
        self.publications.push(Publication::Numeric(id.clone(), value));
    }

    fn publish_text(&mut self, id: &SinkId, value: &str) {
        self.publications
            .push(Publication::Text(id.clone(), value.to_string()));
    }

    fn publish_boolean(&mut self, id: &SinkId, value: bool) {
        self.publications.push(Publication::Boolean(id.clone(), value));
    }
}
