//! Pre-event snapshot computation.
//!
//! Given the recorded state at an event's prev_events, work out the state
//! of the room before the event: share the predecessor's snapshot when
//! nothing changed, append a one-block delta when a single state event
//! changed it, or combine and conflict-resolve when the graph diverged.

use std::collections::HashMap;

use crate::db::{Database, DbError};
use crate::error::InputError;
use crate::input::resolve;
use crate::types::{SnapshotNid, StateAtEvent, StateBlockNid, StateEntry};

/// The maximum number of state-data blocks composed into one snapshot.
/// Below this a change is stored as a delta block; at it, the snapshot is
/// materialized and collapsed into a single block. Bounds read cost per
/// snapshot.
pub const MAX_BLOCKS: usize = 64;

/// How a pre-event state was computed, before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputedState {
    /// The state is exactly an existing snapshot; nothing is written.
    Shared(SnapshotNid),
    /// The state is a predecessor's block list plus one delta block.
    Delta {
        /// The predecessor's block list.
        base: Vec<StateBlockNid>,
        /// Entries forming the new delta block.
        entries: Vec<StateEntry>,
    },
    /// The state is a full mapping written as a single fresh block.
    Full(Vec<StateEntry>),
}

impl ComputedState {
    /// Label for the snapshot-write metric.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Shared(_) => "shared",
            Self::Delta { .. } => "delta",
            Self::Full(_) => "full",
        }
    }
}

/// Materialize a snapshot into its effective state mapping, sorted by
/// state key with one entry per key.
pub async fn materialize(db: &Database, snapshot: SnapshotNid) -> Result<Vec<StateEntry>, DbError> {
    let blocks = snapshot_blocks(db, snapshot).await?;
    materialize_blocks(db, &blocks).await
}

/// The block list of a snapshot.
pub async fn snapshot_blocks(
    db: &Database,
    snapshot: SnapshotNid,
) -> Result<Vec<StateBlockNid>, DbError> {
    let mut lists = db.state().blocks_of(&[snapshot]).await?;
    // blocks_of errors on unknown snapshots, so one list comes back.
    Ok(lists.pop().map(|(_, blocks)| blocks).unwrap_or_default())
}

/// Materialize an ordered block list: concatenate entries in list order
/// and keep the last entry per state key.
pub async fn materialize_blocks(
    db: &Database,
    blocks: &[StateBlockNid],
) -> Result<Vec<StateEntry>, DbError> {
    let mut fetch: Vec<StateBlockNid> = blocks.to_vec();
    fetch.sort();
    fetch.dedup();
    let fetched = db.state().block_entries(&fetch).await?;
    let by_block: HashMap<StateBlockNid, Vec<StateEntry>> = fetched.into_iter().collect();

    let mut combined = Vec::new();
    for block in blocks {
        if let Some(entries) = by_block.get(block) {
            combined.extend_from_slice(entries);
        }
    }
    Ok(last_wins(combined))
}

/// Stable-sort entries by state key and keep the last entry per key.
///
/// Stability is what makes "last" meaningful: within one key, the entry
/// appended latest survives.
pub fn last_wins(mut entries: Vec<StateEntry>) -> Vec<StateEntry> {
    entries.sort_by_key(|entry| entry.key);
    let mut result: Vec<StateEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match result.last_mut() {
            Some(last) if last.key == entry.key => *last = entry,
            _ => result.push(entry),
        }
    }
    result
}

/// Deduplicate the recorded states at an event's prev_events.
///
/// Two prev-events fold into one when they produced identical state and
/// are themselves not state events: their own identity is irrelevant to
/// the state before the new event.
pub fn dedup_prev_states(mut states: Vec<StateAtEvent>) -> Vec<StateAtEvent> {
    states.sort_by_key(|state| (state.before_snapshot, state.state_entry));
    states.dedup_by_key(|state| (state.before_snapshot, state.state_entry));
    states
}

/// Compute the pre-event state from the deduplicated prev states.
///
/// `event_id` is only used to identify the event in error reports.
pub async fn compute_pre_event_state(
    db: &Database,
    event_id: &str,
    prev_states: Vec<StateAtEvent>,
) -> Result<ComputedState, InputError> {
    let prev_states = dedup_prev_states(prev_states);

    match prev_states.as_slice() {
        [] => Err(InputError::OrphanEvent(event_id.to_string())),

        [prev] => {
            let before = prev.before_snapshot.ok_or_else(|| {
                DbError::Corrupt(format!("prev of {event_id} has no assigned snapshot"))
            })?;
            match prev.state_entry {
                // The previous event didn't change state, so this event has
                // exactly the same state. This is the common case.
                None => Ok(ComputedState::Shared(before)),
                // The previous event was a state event: its snapshot with
                // its own entry overlaid.
                Some(entry) => apply_entry(db, before, entry).await,
            }
        }

        _ => {
            let combined = combine_prev_states(db, &prev_states).await?;
            let conflicted = conflicted_entries(&combined);
            if conflicted.is_empty() {
                return Ok(ComputedState::Full(combined));
            }
            let resolved = resolve::resolve_conflicts(db, &combined, conflicted).await?;
            Ok(ComputedState::Full(resolved))
        }
    }
}

/// Overlay one state entry on a snapshot, respecting the block budget.
pub async fn apply_entry(
    db: &Database,
    snapshot: SnapshotNid,
    entry: StateEntry,
) -> Result<ComputedState, InputError> {
    let blocks = snapshot_blocks(db, snapshot).await?;
    if blocks.len() < MAX_BLOCKS {
        return Ok(ComputedState::Delta {
            base: blocks,
            entries: vec![entry],
        });
    }
    // Too many deltas: materialize and collapse to one block.
    let mut entries = materialize_blocks(db, &blocks).await?;
    entries.push(entry);
    Ok(ComputedState::Full(last_wins(entries)))
}

/// Check whether an existing snapshot already has the composition
/// `base_blocks + [block(entries)]`, and can therefore be shared instead
/// of writing a duplicate.
///
/// Events whose pre-event state is identical share one snapshot; the
/// common case is an event following straight after a state event, whose
/// pre-event state equals the room's current snapshot.
pub async fn try_reuse_snapshot(
    db: &Database,
    candidate: Option<SnapshotNid>,
    base_blocks: &[StateBlockNid],
    entries: &[StateEntry],
) -> Result<Option<SnapshotNid>, DbError> {
    let Some(candidate) = candidate else {
        return Ok(None);
    };
    let blocks = snapshot_blocks(db, candidate).await?;
    let Some((last, prefix)) = blocks.split_last() else {
        return Ok(None);
    };
    if prefix != base_blocks {
        return Ok(None);
    }
    let mut sorted = entries.to_vec();
    sorted.sort();
    sorted.dedup();
    let last_entries = db.state().block_entries(&[*last]).await?;
    let matches = last_entries
        .first()
        .map(|(_, block_entries)| block_entries.as_slice() == sorted.as_slice())
        .unwrap_or(false);
    Ok(matches.then_some(candidate))
}

/// Persist a computed state, returning its snapshot NID.
pub async fn write_computed(
    db: &Database,
    room_nid: crate::types::RoomNid,
    computed: &ComputedState,
) -> Result<SnapshotNid, DbError> {
    match computed {
        ComputedState::Shared(snapshot) => Ok(*snapshot),
        ComputedState::Delta { base, entries } => {
            db.state().write_snapshot(room_nid, base, entries).await
        }
        ComputedState::Full(entries) => db.state().write_snapshot(room_nid, &[], entries).await,
    }
}

/// Combine the materialized states of divergent prev-events into one
/// sorted multiset of entries, at most one entry per (key, event) pair.
pub(crate) async fn combine_prev_states(
    db: &Database,
    prev_states: &[StateAtEvent],
) -> Result<Vec<StateEntry>, DbError> {
    // Batch-load every referenced snapshot's blocks and entries.
    let mut snapshots: Vec<SnapshotNid> = Vec::new();
    for prev in prev_states {
        if let Some(snapshot) = prev.before_snapshot {
            snapshots.push(snapshot);
        }
    }
    snapshots.sort();
    snapshots.dedup();

    let block_lists = db.state().blocks_of(&snapshots).await?;
    let mut all_blocks: Vec<StateBlockNid> = block_lists
        .iter()
        .flat_map(|(_, blocks)| blocks.iter().copied())
        .collect();
    all_blocks.sort();
    all_blocks.dedup();
    let fetched = db.state().block_entries(&all_blocks).await?;
    let by_block: HashMap<StateBlockNid, Vec<StateEntry>> = fetched.into_iter().collect();
    let by_snapshot: HashMap<SnapshotNid, &Vec<StateBlockNid>> = block_lists
        .iter()
        .map(|(snapshot, blocks)| (*snapshot, blocks))
        .collect();

    let mut combined = Vec::new();
    for prev in prev_states {
        let Some(snapshot) = prev.before_snapshot else {
            continue;
        };
        let mut full_state = Vec::new();
        if let Some(blocks) = by_snapshot.get(&snapshot) {
            for block in blocks.iter() {
                if let Some(entries) = by_block.get(block) {
                    full_state.extend_from_slice(entries);
                }
            }
        }
        // A state-event prev overrides its own key in its snapshot.
        if let Some(entry) = prev.state_entry {
            full_state.push(entry);
        }
        combined.extend(last_wins(full_state));
    }

    combined.sort();
    combined.dedup();
    Ok(combined)
}

/// Entries belonging to state keys with more than one distinct event.
///
/// Expects `combined` sorted in canonical entry order.
pub(crate) fn conflicted_entries(combined: &[StateEntry]) -> Vec<StateEntry> {
    let mut conflicted = Vec::new();
    let mut i = 0;
    while i < combined.len() {
        let mut j = i + 1;
        while j < combined.len() && combined[j].key == combined[i].key {
            j += 1;
        }
        if j - i > 1 {
            conflicted.extend_from_slice(&combined[i..j]);
        }
        i = j;
    }
    conflicted
}
