//! Input pipeline: ingests room events and computes their pre-event state.
//!
//! The consumer drains the ingress log in partition order and threads each
//! record through the handler: parse, locate the room, intern identifiers,
//! persist the event, compute and bind the pre-event snapshot, update the
//! room's DAG edges, and emit the output record.

pub mod consumer;
pub mod handler;
pub mod resolve;
pub mod snapshot;

pub use consumer::Consumer;
pub use handler::InputHandler;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// How an input event relates to the room's contiguous event graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Stored for its signature / auth value only; not placed in the
    /// contiguous graph and given no state.
    Outlier,
    /// Starts (or restarts) the server's participation in a room.
    Join,
    /// Extends the contiguous graph forwards.
    New,
    /// Extends the contiguous graph backwards.
    Backfill,
}

impl InputKind {
    /// Static label for logging and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outlier => "outlier",
            Self::Join => "join",
            Self::New => "new",
            Self::Backfill => "backfill",
        }
    }
}

/// One record of the ingress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEvent {
    /// How the event relates to the contiguous graph.
    pub kind: InputKind,
    /// The raw signed event JSON, passed through verbatim.
    pub event_json: Box<RawValue>,
    /// Optional IDs of state events forming the state before this event.
    /// They must already be persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_event_ids: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_json() {
        let record: InputEvent = serde_json::from_str(
            r#"{"kind":"backfill","event_json":{"event_id":"$e:h"},"state_event_ids":["$s:h"]}"#,
        )
        .unwrap();
        assert_eq!(record.kind, InputKind::Backfill);
        assert_eq!(record.state_event_ids.as_deref(), Some(&["$s:h".to_string()][..]));

        let encoded = serde_json::to_string(&record).unwrap();
        assert!(encoded.contains(r#""kind":"backfill""#));
        assert!(encoded.contains(r#"{"event_id":"$e:h"}"#));
    }

    #[test]
    fn absent_state_ids_stay_absent() {
        let record: InputEvent =
            serde_json::from_str(r#"{"kind":"new","event_json":{}}"#).unwrap();
        assert_eq!(record.state_event_ids, None);
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(!encoded.contains("state_event_ids"));
    }
}
