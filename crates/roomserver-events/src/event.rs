//! Parsed room events.

use serde::Deserialize;
use serde_json::Value;

use crate::canonical::reference_hash;
use crate::error::EventError;

/// The event type that creates a room.
pub const TYPE_CREATE: &str = "m.room.create";
/// The event type carrying the room's power-level table.
pub const TYPE_POWER_LEVELS: &str = "m.room.power_levels";
/// The event type carrying the room's join rules.
pub const TYPE_JOIN_RULES: &str = "m.room.join_rules";
/// The event type recording a third-party invite token.
pub const TYPE_THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";
/// The event type recording a user's membership.
pub const TYPE_MEMBER: &str = "m.room.member";

/// A parsed room event.
///
/// Wraps the raw signed JSON together with the handful of fields the
/// room-state machinery needs: identity, graph position, type/state-key,
/// and content. The raw bytes are kept verbatim so they can be re-emitted
/// byte-for-byte downstream.
#[derive(Debug, Clone)]
pub struct Event {
    raw: Vec<u8>,
    fields: EventFields,
    prev_event_ids: Vec<String>,
    reference_hash: [u8; 32],
}

/// The JSON fields extracted during parsing.
#[derive(Debug, Clone, Deserialize)]
struct EventFields {
    event_id: String,
    room_id: String,
    sender: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    depth: i64,
    #[serde(default)]
    prev_events: Vec<PrevEvent>,
    #[serde(default)]
    content: Value,
}

/// A `prev_events` entry: either a bare event ID or a reference pair of
/// `[event_id, hashes]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PrevEvent {
    Id(String),
    Reference(Vec<Value>),
}

impl Event {
    /// Parse an event from its raw JSON bytes.
    ///
    /// The reference hash is computed eagerly so that a parsed event always
    /// carries it; malformed `prev_events` entries are rejected rather than
    /// skipped, since a missing graph edge would silently corrupt the DAG.
    pub fn parse(raw: &[u8]) -> Result<Self, EventError> {
        let fields: EventFields = serde_json::from_slice(raw)?;
        if fields.event_id.is_empty() {
            return Err(EventError::Field("event_id"));
        }
        if fields.room_id.is_empty() {
            return Err(EventError::Field("room_id"));
        }
        if fields.event_type.is_empty() {
            return Err(EventError::Field("type"));
        }

        let mut prev_event_ids = Vec::with_capacity(fields.prev_events.len());
        for (i, prev) in fields.prev_events.iter().enumerate() {
            match prev {
                PrevEvent::Id(id) => prev_event_ids.push(id.clone()),
                PrevEvent::Reference(parts) => {
                    let id = parts
                        .first()
                        .and_then(Value::as_str)
                        .ok_or(EventError::PrevEventReference(i))?;
                    prev_event_ids.push(id.to_string());
                }
            }
        }

        let reference_hash = reference_hash(raw)?;

        Ok(Self {
            raw: raw.to_vec(),
            fields,
            prev_event_ids,
            reference_hash,
        })
    }

    /// The raw JSON the event was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The event's globally unique ID.
    pub fn event_id(&self) -> &str {
        &self.fields.event_id
    }

    /// The room this event belongs to.
    pub fn room_id(&self) -> &str {
        &self.fields.room_id
    }

    /// The user that sent the event.
    pub fn sender(&self) -> &str {
        &self.fields.sender
    }

    /// The event type, e.g. `m.room.member`.
    pub fn event_type(&self) -> &str {
        &self.fields.event_type
    }

    /// The state key, if the event is a state event.
    pub fn state_key(&self) -> Option<&str> {
        self.fields.state_key.as_deref()
    }

    /// Whether the event is a state event (carries a state key).
    pub fn is_state(&self) -> bool {
        self.fields.state_key.is_some()
    }

    /// The event's depth in the room DAG.
    pub fn depth(&self) -> i64 {
        self.fields.depth
    }

    /// IDs of the events this event points at as its predecessors.
    pub fn prev_event_ids(&self) -> &[String] {
        &self.prev_event_ids
    }

    /// The event content object.
    pub fn content(&self) -> &Value {
        &self.fields.content
    }

    /// The SHA-256 reference hash over the canonicalized event.
    pub fn reference_hash(&self) -> &[u8; 32] {
        &self.reference_hash
    }

    /// The `membership` content field, for `m.room.member` events.
    pub fn membership(&self) -> Option<&str> {
        self.fields.content.get("membership").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn parses_a_state_event() {
        let bytes = raw(json!({
            "event_id": "$m1:h",
            "room_id": "!r:h",
            "sender": "@alice:h",
            "type": "m.room.member",
            "state_key": "@alice:h",
            "depth": 3,
            "prev_events": [["$p1:h", {}], "$p2:h"],
            "content": {"membership": "join"}
        }));

        let event = Event::parse(&bytes).unwrap();
        assert_eq!(event.event_id(), "$m1:h");
        assert!(event.is_state());
        assert_eq!(event.state_key(), Some("@alice:h"));
        assert_eq!(event.depth(), 3);
        assert_eq!(event.prev_event_ids(), ["$p1:h", "$p2:h"]);
        assert_eq!(event.membership(), Some("join"));
        assert_eq!(event.raw(), &bytes[..]);
    }

    #[test]
    fn non_state_event_has_no_state_key() {
        let bytes = raw(json!({
            "event_id": "$m2:h",
            "room_id": "!r:h",
            "sender": "@alice:h",
            "type": "m.room.message",
            "depth": 4,
            "prev_events": [],
            "content": {"body": "hi"}
        }));

        let event = Event::parse(&bytes).unwrap();
        assert!(!event.is_state());
        assert_eq!(event.membership(), None);
    }

    #[test]
    fn empty_state_key_is_still_a_state_event() {
        let bytes = raw(json!({
            "event_id": "$c:h",
            "room_id": "!r:h",
            "sender": "@alice:h",
            "type": "m.room.create",
            "state_key": "",
            "content": {}
        }));

        let event = Event::parse(&bytes).unwrap();
        assert!(event.is_state());
        assert_eq!(event.state_key(), Some(""));
    }

    #[test]
    fn rejects_malformed_prev_reference() {
        let bytes = raw(json!({
            "event_id": "$m3:h",
            "room_id": "!r:h",
            "sender": "@alice:h",
            "type": "m.room.message",
            "prev_events": [[42, {}]],
            "content": {}
        }));

        assert!(matches!(
            Event::parse(&bytes),
            Err(EventError::PrevEventReference(0))
        ));
    }

    #[test]
    fn rejects_missing_identity_fields() {
        let bytes = raw(json!({
            "event_id": "",
            "room_id": "!r:h",
            "sender": "@alice:h",
            "type": "m.room.message",
            "content": {}
        }));
        assert!(matches!(Event::parse(&bytes), Err(EventError::Field("event_id"))));
    }
}
