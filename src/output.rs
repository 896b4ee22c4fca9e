//! Output publisher: the state-delta record emitted after each
//! non-outlier commit.
//!
//! Consumers are external, so state changes are reported as event IDs,
//! not NIDs, and the event JSON is passed through verbatim. The struct's
//! field order is the wire order; together with sorted ID lists this
//! keeps the egress byte-identical across runs.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

use roomserver_events::Event;

use crate::db::Database;
use crate::error::InputError;
use crate::input::snapshot;
use crate::types::{
    EMPTY_STATE_KEY_NID, EVENT_TYPE_JOIN_RULES_NID, EVENT_TYPE_MEMBER_NID, EventNid, SnapshotNid,
    StateEntry, StateKeyPair,
};

/// The history-visibility event type. Not a reserved interning value; it
/// is interned on first sight like any other type.
const TYPE_HISTORY_VISIBILITY: &str = "m.room.history_visibility";

/// One record of the egress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNewEvent {
    /// The new room event JSON, verbatim.
    pub event_json: Box<RawValue>,
    /// IDs of events whose state-key mapping this commit added or changed.
    pub add_state: Vec<String>,
    /// IDs of events whose state-key mapping no longer holds.
    pub remove_state: Vec<String>,
    /// Whether consumers should drop existing room state before applying
    /// the delta. Set when the server (re)joins a room.
    pub reset_state: bool,
    /// IDs of the events needed to evaluate who may see this event.
    pub visibility_state: Vec<String>,
}

/// Compute the `(add, remove)` delta between two materialized states.
///
/// An entry is added when its key maps to a different event than before
/// (or is new); removed when its old mapping no longer holds.
fn state_delta(baseline: &[StateEntry], new: &[StateEntry]) -> (Vec<EventNid>, Vec<EventNid>) {
    let base_map: HashMap<StateKeyPair, EventNid> = baseline
        .iter()
        .map(|entry| (entry.key, entry.event_nid))
        .collect();
    let new_map: HashMap<StateKeyPair, EventNid> = new
        .iter()
        .map(|entry| (entry.key, entry.event_nid))
        .collect();

    let added = new
        .iter()
        .filter(|entry| base_map.get(&entry.key) != Some(&entry.event_nid))
        .map(|entry| entry.event_nid)
        .collect();
    let removed = baseline
        .iter()
        .filter(|entry| new_map.get(&entry.key) != Some(&entry.event_nid))
        .map(|entry| entry.event_nid)
        .collect();
    (added, removed)
}

/// Build the output record for a committed non-outlier event.
///
/// The delta baseline is the room's previous current state; on a reset it
/// is the event's own pre-event snapshot, since consumers bootstrap the
/// prior state out of band when the server joins.
pub async fn build_output(
    db: &Database,
    event: &Event,
    before_snapshot: SnapshotNid,
    new_current: SnapshotNid,
    old_current: Option<SnapshotNid>,
    reset_state: bool,
) -> Result<OutputNewEvent, InputError> {
    let new_entries = snapshot::materialize(db, new_current).await?;
    let baseline = if reset_state {
        snapshot::materialize(db, before_snapshot).await?
    } else if let Some(old) = old_current {
        snapshot::materialize(db, old).await?
    } else {
        Vec::new()
    };

    let (add_nids, remove_nids) = state_delta(&baseline, &new_entries);

    // The slice of state deciding event visibility: history visibility,
    // join rules, and the sender's membership.
    let new_map: HashMap<StateKeyPair, EventNid> = new_entries
        .iter()
        .map(|entry| (entry.key, entry.event_nid))
        .collect();
    let mut visibility_keys = vec![StateKeyPair::new(
        EVENT_TYPE_JOIN_RULES_NID,
        EMPTY_STATE_KEY_NID,
    )];
    if let Some(hv_nid) = db
        .interner()
        .lookup_event_type_nid(TYPE_HISTORY_VISIBILITY)
        .await?
    {
        visibility_keys.push(StateKeyPair::new(hv_nid, EMPTY_STATE_KEY_NID));
    }
    if let Some(sender_nid) = db.interner().lookup_state_key_nid(event.sender()).await? {
        visibility_keys.push(StateKeyPair::new(EVENT_TYPE_MEMBER_NID, sender_nid));
    }
    let visibility_nids: Vec<EventNid> = visibility_keys
        .iter()
        .filter_map(|key| new_map.get(key).copied())
        .collect();

    // Map every referenced NID back to its event ID in one load.
    let mut wanted: Vec<EventNid> = Vec::new();
    wanted.extend_from_slice(&add_nids);
    wanted.extend_from_slice(&remove_nids);
    wanted.extend_from_slice(&visibility_nids);
    wanted.sort();
    wanted.dedup();
    let stored = db.events().events_by_nids(&wanted).await?;
    let ids: HashMap<EventNid, String> = stored
        .into_iter()
        .map(|row| (row.event_nid, row.event_id))
        .collect();

    let to_ids = |nids: &[EventNid]| -> Vec<String> {
        let mut out: Vec<String> = nids.iter().filter_map(|nid| ids.get(nid).cloned()).collect();
        out.sort();
        out.dedup();
        out
    };

    let event_json: Box<RawValue> = serde_json::from_slice(event.raw())
        .map_err(roomserver_events::EventError::Json)?;

    Ok(OutputNewEvent {
        event_json,
        add_state: to_ids(&add_nids),
        remove_state: to_ids(&remove_nids),
        reset_state,
        visibility_state: to_ids(&visibility_nids),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventTypeNid, StateKeyNid};

    fn entry(t: i64, k: i64, e: i64) -> StateEntry {
        StateEntry {
            key: StateKeyPair::new(EventTypeNid(t), StateKeyNid(k)),
            event_nid: EventNid(e),
        }
    }

    #[test]
    fn delta_reports_changed_and_new_keys() {
        let baseline = vec![entry(1, 1, 1), entry(5, 2, 4)];
        let new = vec![entry(1, 1, 1), entry(5, 2, 9), entry(6, 1, 10)];

        let (added, removed) = state_delta(&baseline, &new);
        assert_eq!(added, vec![EventNid(9), EventNid(10)]);
        assert_eq!(removed, vec![EventNid(4)]);
    }

    #[test]
    fn delta_is_empty_for_identical_states() {
        let state = vec![entry(1, 1, 1), entry(2, 1, 2)];
        let (added, removed) = state_delta(&state, &state);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn output_serializes_with_stable_field_order() {
        let output = OutputNewEvent {
            event_json: serde_json::value::RawValue::from_string("{\"a\":1}".into()).unwrap(),
            add_state: vec!["$x:h".into()],
            remove_state: vec![],
            reset_state: true,
            visibility_state: vec![],
        };
        let encoded = serde_json::to_string(&output).unwrap();
        assert_eq!(
            encoded,
            r#"{"event_json":{"a":1},"add_state":["$x:h"],"remove_state":[],"reset_state":true,"visibility_state":[]}"#
        );
    }
}
