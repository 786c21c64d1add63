//! Append-only event log entries.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

#[derive(
    AsRefStr, Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Kind of a structured mutation recorded in the event log.
pub enum EventKind {
    Interface,
    Device,
    Credential,
    Meta,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// One entry of the append-only event log. Timestamps are monotonically
/// non-decreasing in insertion order.
pub struct Event {
    timestamp: f64,
    #[serde(rename = "type")]
    kind: EventKind,
    id: String,
    data: serde_json::Value,
}

impl Event {
    pub fn new(timestamp: f64, kind: EventKind, id: &str, data: serde_json::Value) -> Self {
        Self {
            timestamp,
            kind,
            id: id.to_string(),
            data,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Clamp the timestamp so it never precedes `floor`.
    pub(crate) fn clamp_after(&mut self, floor: f64) {
        if self.timestamp < floor {
            self.timestamp = floor;
        }
    }
}
