//! Numeric identifiers and state-entry types.
//!
//! Every string identifier (room ID, event ID, event type, state key) is
//! interned to a numeric ID on first sight. All state comparison, sorting
//! and delta storage operates on these integers.

use serde::{Deserialize, Serialize};

macro_rules! nid_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

nid_type! {
    /// Numeric ID of a room.
    RoomNid
}
nid_type! {
    /// Numeric ID of an event.
    EventNid
}
nid_type! {
    /// Numeric ID of an event type string.
    EventTypeNid
}
nid_type! {
    /// Numeric ID of a state key string.
    StateKeyNid
}
nid_type! {
    /// Numeric ID of a state snapshot.
    SnapshotNid
}
nid_type! {
    /// Numeric ID of a state-data block.
    StateBlockNid
}

/// Reserved type NID for `m.room.create`.
pub const EVENT_TYPE_CREATE_NID: EventTypeNid = EventTypeNid(1);
/// Reserved type NID for `m.room.power_levels`.
pub const EVENT_TYPE_POWER_LEVELS_NID: EventTypeNid = EventTypeNid(2);
/// Reserved type NID for `m.room.join_rules`.
pub const EVENT_TYPE_JOIN_RULES_NID: EventTypeNid = EventTypeNid(3);
/// Reserved type NID for `m.room.third_party_invite`.
pub const EVENT_TYPE_THIRD_PARTY_INVITE_NID: EventTypeNid = EventTypeNid(4);
/// Reserved type NID for `m.room.member`.
pub const EVENT_TYPE_MEMBER_NID: EventTypeNid = EventTypeNid(5);
/// Highest reserved type NID. Types at or below this value are consulted by
/// the auth rules and are resolved before anything else during conflict
/// resolution.
pub const MAX_AUTH_EVENT_TYPE_NID: EventTypeNid = EventTypeNid(5);
/// Reserved NID for the empty state key.
pub const EMPTY_STATE_KEY_NID: StateKeyNid = StateKeyNid(1);

/// The interned `(event type, state key)` pair a state event sets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateKeyPair {
    /// Interned event type.
    pub event_type_nid: EventTypeNid,
    /// Interned state key.
    pub event_state_key_nid: StateKeyNid,
}

impl StateKeyPair {
    /// Build a pair from its components.
    pub fn new(event_type_nid: EventTypeNid, event_state_key_nid: StateKeyNid) -> Self {
        Self {
            event_type_nid,
            event_state_key_nid,
        }
    }

    /// Whether the pair's type is consulted by the auth rules.
    pub fn is_auth_type(&self) -> bool {
        self.event_type_nid <= MAX_AUTH_EVENT_TYPE_NID
    }
}

/// One entry of a state mapping: a state key and the event that set it.
///
/// The derived ordering — type NID, then state key NID, then event NID — is
/// the canonical ordering used everywhere entries are sorted, compared or
/// grouped into conflict blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateEntry {
    /// The state key the entry sets.
    pub key: StateKeyPair,
    /// The event holding the value.
    pub event_nid: EventNid,
}

/// The state recorded for an event: its position in the state mapping (if
/// it is a state event) and the snapshot of the room before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateAtEvent {
    /// The event.
    pub event_nid: EventNid,
    /// The event's own state entry; `None` for non-state events.
    pub state_entry: Option<StateEntry>,
    /// The snapshot of the room state before the event, once assigned.
    pub before_snapshot: Option<SnapshotNid>,
}
