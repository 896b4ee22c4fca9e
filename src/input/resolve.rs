//! Auth-gated conflict resolution.
//!
//! When divergent forward edges disagree about a state key, the competing
//! events form a conflict block. Blocks are resolved in state-key order,
//! which puts the auth-relevant types (create, power_levels, join_rules,
//! third_party_invite, member) first; each decided block is promoted into
//! the auth accumulator so later blocks are judged against freshly
//! resolved auth state.

use std::collections::{HashMap, HashSet};

use roomserver_events::{AuthProvider, Event, StateNeeded, allowed};
use tracing::warn;

use crate::db::{Database, DbError};
use crate::error::InputError;
use crate::metrics;
use crate::types::{
    EMPTY_STATE_KEY_NID, EVENT_TYPE_CREATE_NID, EVENT_TYPE_JOIN_RULES_NID, EVENT_TYPE_MEMBER_NID,
    EVENT_TYPE_POWER_LEVELS_NID, EVENT_TYPE_THIRD_PARTY_INVITE_NID, EventNid, StateEntry,
    StateKeyPair,
};

/// The auth accumulator: starts from the unconflicted state and absorbs
/// each resolved block before the next one is judged.
#[derive(Default)]
struct ResolvedAuth {
    create: Option<Event>,
    power_levels: Option<Event>,
    join_rules: Option<Event>,
    member: HashMap<String, Event>,
    third_party_invite: HashMap<String, Event>,
}

impl ResolvedAuth {
    fn promote(&mut self, key: StateKeyPair, event: &Event) {
        if key.event_state_key_nid == EMPTY_STATE_KEY_NID {
            if key.event_type_nid == EVENT_TYPE_CREATE_NID {
                self.create = Some(event.clone());
            } else if key.event_type_nid == EVENT_TYPE_POWER_LEVELS_NID {
                self.power_levels = Some(event.clone());
            } else if key.event_type_nid == EVENT_TYPE_JOIN_RULES_NID {
                self.join_rules = Some(event.clone());
            }
        }
        if let Some(state_key) = event.state_key() {
            if key.event_type_nid == EVENT_TYPE_MEMBER_NID {
                self.member.insert(state_key.to_string(), event.clone());
            } else if key.event_type_nid == EVENT_TYPE_THIRD_PARTY_INVITE_NID {
                self.third_party_invite
                    .insert(state_key.to_string(), event.clone());
            }
        }
    }
}

impl AuthProvider for ResolvedAuth {
    fn create(&self) -> Option<&Event> {
        self.create.as_ref()
    }
    fn power_levels(&self) -> Option<&Event> {
        self.power_levels.as_ref()
    }
    fn join_rules(&self) -> Option<&Event> {
        self.join_rules.as_ref()
    }
    fn member(&self, state_key: &str) -> Option<&Event> {
        self.member.get(state_key)
    }
    fn third_party_invite(&self, state_key: &str) -> Option<&Event> {
        self.third_party_invite.get(state_key)
    }
}

/// One competitor within a conflict block.
struct Candidate {
    event_nid: EventNid,
    depth: i64,
    reference_hash: Vec<u8>,
    event: Event,
}

/// Resolve conflicted state entries against the combined state.
///
/// `combined` is the full sorted multiset of entries from every divergent
/// prev-state; `conflicted` is the subset belonging to keys with more
/// than one distinct event. Returns the authoritative state: one entry
/// per key, sorted.
pub async fn resolve_conflicts(
    db: &Database,
    combined: &[StateEntry],
    mut conflicted: Vec<StateEntry>,
) -> Result<Vec<StateEntry>, InputError> {
    conflicted.sort();

    let conflicted_keys: HashSet<StateKeyPair> =
        conflicted.iter().map(|entry| entry.key).collect();
    let unconflicted: Vec<StateEntry> = combined
        .iter()
        .filter(|entry| !conflicted_keys.contains(&entry.key))
        .copied()
        .collect();
    let unconflicted_map: HashMap<StateKeyPair, EventNid> = unconflicted
        .iter()
        .map(|entry| (entry.key, entry.event_nid))
        .collect();

    // Load and parse every competing event.
    let mut conflict_nids: Vec<EventNid> = conflicted.iter().map(|entry| entry.event_nid).collect();
    conflict_nids.sort();
    conflict_nids.dedup();
    let conflict_events = load_events(db, &conflict_nids).await?;

    // Work out which auth state the competitors need, then load it from
    // the unconflicted state.
    let needed = StateNeeded::for_events(conflict_events.values().map(|(event, _)| event));
    let mut auth = load_auth(db, &needed, &unconflicted_map).await?;

    // Resolve block by block, in canonical key order.
    let mut resolved = Vec::new();
    let mut i = 0;
    while i < conflicted.len() {
        let key = conflicted[i].key;
        let mut j = i + 1;
        while j < conflicted.len() && conflicted[j].key == key {
            j += 1;
        }

        let mut candidates: Vec<Candidate> = conflicted[i..j]
            .iter()
            .map(|entry| {
                let (event, reference_hash) =
                    conflict_events.get(&entry.event_nid).cloned().ok_or_else(|| {
                        DbError::Corrupt(format!("missing conflict event {}", entry.event_nid))
                    })?;
                Ok(Candidate {
                    event_nid: entry.event_nid,
                    depth: event.depth(),
                    reference_hash,
                    event,
                })
            })
            .collect::<Result<_, DbError>>()?;

        // Block order is ascending (depth, reference hash): deeper events
        // win, and on equal depth the larger hash wins, so the most
        // recent candidate sits last. The trailing NID comparison makes
        // the order total.
        candidates.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.reference_hash.cmp(&b.reference_hash))
                .then_with(|| a.event_nid.cmp(&b.event_nid))
        });

        let winner = resolve_block(key, &candidates, &auth);
        auth.promote(key, &candidates[winner].event);
        resolved.push(StateEntry {
            key,
            event_nid: candidates[winner].event_nid,
        });
        metrics::CONFLICTS_RESOLVED.inc();

        i = j;
    }

    resolved.extend(unconflicted);
    resolved.sort();
    Ok(resolved)
}

/// Pick the winning candidate index for one block.
fn resolve_block(key: StateKeyPair, candidates: &[Candidate], auth: &ResolvedAuth) -> usize {
    if key.is_auth_type() {
        // Most-recent-authorized: walk backwards from the deepest
        // candidate and take the first one the auth rules accept.
        for i in (0..candidates.len()).rev() {
            if allowed(&candidates[i].event, auth).is_ok() {
                return i;
            }
        }
        // Resolution must produce some answer; fall back to the first
        // candidate in block order.
        metrics::DEGRADED_RESOLUTIONS.inc();
        warn!(
            event_nid = %candidates[0].event_nid,
            "no candidate in auth-relevant conflict block passed auth, using first"
        );
        0
    } else {
        // Greedy admission: keep accepting candidates in block order and
        // stop at the first one the auth rules reject.
        let mut winner = 0;
        for (i, candidate) in candidates.iter().enumerate().skip(1) {
            if allowed(&candidate.event, auth).is_ok() {
                winner = i;
            } else {
                break;
            }
        }
        winner
    }
}

/// Load and parse stored events, keyed by NID, with their reference hashes.
async fn load_events(
    db: &Database,
    event_nids: &[EventNid],
) -> Result<HashMap<EventNid, (Event, Vec<u8>)>, InputError> {
    let stored = db.events().events_by_nids(event_nids).await?;
    let mut events = HashMap::with_capacity(stored.len());
    for row in stored {
        let event = Event::parse(&row.event_json).map_err(|e| {
            DbError::Corrupt(format!("unparseable stored event {}: {e}", row.event_nid))
        })?;
        events.insert(row.event_nid, (event, row.reference_sha256));
    }
    Ok(events)
}

/// Build the initial auth accumulator from the unconflicted state.
async fn load_auth(
    db: &Database,
    needed: &StateNeeded,
    unconflicted: &HashMap<StateKeyPair, EventNid>,
) -> Result<ResolvedAuth, InputError> {
    let member_nids = db.interner().lookup_state_key_nids(&needed.member).await?;
    let invite_nids = db
        .interner()
        .lookup_state_key_nids(&needed.third_party_invite)
        .await?;

    let singleton = |type_nid| unconflicted
        .get(&StateKeyPair::new(type_nid, EMPTY_STATE_KEY_NID))
        .copied();

    let mut wanted: Vec<EventNid> = Vec::new();
    if needed.create && let Some(nid) = singleton(EVENT_TYPE_CREATE_NID) {
        wanted.push(nid);
    }
    if needed.power_levels && let Some(nid) = singleton(EVENT_TYPE_POWER_LEVELS_NID) {
        wanted.push(nid);
    }
    if needed.join_rules && let Some(nid) = singleton(EVENT_TYPE_JOIN_RULES_NID) {
        wanted.push(nid);
    }
    for (_, key_nid) in &member_nids {
        if let Some(nid) = unconflicted.get(&StateKeyPair::new(EVENT_TYPE_MEMBER_NID, *key_nid)) {
            wanted.push(*nid);
        }
    }
    for (_, key_nid) in &invite_nids {
        if let Some(nid) =
            unconflicted.get(&StateKeyPair::new(EVENT_TYPE_THIRD_PARTY_INVITE_NID, *key_nid))
        {
            wanted.push(*nid);
        }
    }
    wanted.sort();
    wanted.dedup();

    let events = load_events(db, &wanted).await?;
    let get = |nid: Option<EventNid>| {
        nid.and_then(|nid| events.get(&nid)).map(|(event, _)| event.clone())
    };

    let mut auth = ResolvedAuth {
        create: get(singleton(EVENT_TYPE_CREATE_NID)),
        power_levels: get(singleton(EVENT_TYPE_POWER_LEVELS_NID)),
        join_rules: get(singleton(EVENT_TYPE_JOIN_RULES_NID)),
        ..ResolvedAuth::default()
    };
    for (state_key, key_nid) in member_nids {
        let nid = unconflicted.get(&StateKeyPair::new(EVENT_TYPE_MEMBER_NID, key_nid));
        if let Some(event) = get(nid.copied()) {
            auth.member.insert(state_key, event);
        }
    }
    for (state_key, key_nid) in invite_nids {
        let nid = unconflicted.get(&StateKeyPair::new(EVENT_TYPE_THIRD_PARTY_INVITE_NID, key_nid));
        if let Some(event) = get(nid.copied()) {
            auth.third_party_invite.insert(state_key, event);
        }
    }
    Ok(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoomNid, StateKeyNid};
    use serde_json::json;

    /// Intern and persist an event, returning its state entry.
    async fn store_state_event(
        db: &Database,
        event_id: &str,
        event_type: &str,
        state_key: &str,
        sender: &str,
        depth: i64,
        content: serde_json::Value,
    ) -> StateEntry {
        let raw = serde_json::to_vec(&json!({
            "event_id": event_id,
            "room_id": "!r:h",
            "sender": sender,
            "type": event_type,
            "state_key": state_key,
            "depth": depth,
            "prev_events": [],
            "content": content,
        }))
        .unwrap();
        let event = Event::parse(&raw).unwrap();

        let type_nid = db.interner().assign_event_type_nid(event_type).await.unwrap();
        let key_nid = db.interner().assign_state_key_nid(state_key).await.unwrap();
        let added = db
            .events()
            .add_event(
                event_id,
                RoomNid(1),
                depth,
                type_nid,
                Some(key_nid),
                event.reference_hash(),
                &raw,
            )
            .await
            .unwrap();
        StateEntry {
            key: StateKeyPair::new(type_nid, key_nid),
            event_nid: added.event_nid,
        }
    }

    /// A room skeleton: create by alice, alice and carol joined.
    async fn base_state(db: &Database) -> Vec<StateEntry> {
        let create = store_state_event(db, "$create:h", "m.room.create", "", "@alice:h", 1, json!({}))
            .await;
        let alice = store_state_event(
            db,
            "$alice:h",
            "m.room.member",
            "@alice:h",
            "@alice:h",
            2,
            json!({"membership": "join"}),
        )
        .await;
        let carol = store_state_event(
            db,
            "$carol:h",
            "m.room.member",
            "@carol:h",
            "@carol:h",
            2,
            json!({"membership": "join"}),
        )
        .await;
        let mut state = vec![create, alice, carol];
        state.sort();
        state
    }

    fn hash_of(db_entry: &StateEntry, events: &HashMap<EventNid, (Event, Vec<u8>)>) -> Vec<u8> {
        events.get(&db_entry.event_nid).unwrap().1.clone()
    }

    #[tokio::test]
    async fn equal_depth_ties_break_on_larger_hash() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;

        // Two invites for bob at the same depth, both authorized.
        let e1 = store_state_event(
            &db,
            "$invite1:h",
            "m.room.member",
            "@bob:h",
            "@alice:h",
            5,
            json!({"membership": "invite"}),
        )
        .await;
        let e2 = store_state_event(
            &db,
            "$invite2:h",
            "m.room.member",
            "@bob:h",
            "@carol:h",
            5,
            json!({"membership": "invite"}),
        )
        .await;
        combined.extend([e1, e2]);
        combined.sort();

        let resolved = resolve_conflicts(&db, &combined, vec![e1, e2]).await.unwrap();

        let events = load_events(&db, &[e1.event_nid, e2.event_nid]).await.unwrap();
        let expected = if hash_of(&e1, &events) > hash_of(&e2, &events) {
            e1
        } else {
            e2
        };
        let winner = resolved.iter().find(|entry| entry.key == e1.key).unwrap();
        assert_eq!(winner.event_nid, expected.event_nid);
    }

    #[tokio::test]
    async fn deeper_event_beats_shallower() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;

        let shallow = store_state_event(
            &db,
            "$shallow:h",
            "m.room.member",
            "@bob:h",
            "@alice:h",
            3,
            json!({"membership": "invite"}),
        )
        .await;
        let deep = store_state_event(
            &db,
            "$deep:h",
            "m.room.member",
            "@bob:h",
            "@carol:h",
            9,
            json!({"membership": "invite"}),
        )
        .await;
        combined.extend([shallow, deep]);
        combined.sort();

        let resolved = resolve_conflicts(&db, &combined, vec![deep, shallow])
            .await
            .unwrap();
        let winner = resolved.iter().find(|entry| entry.key == deep.key).unwrap();
        assert_eq!(winner.event_nid, deep.event_nid);
    }

    #[tokio::test]
    async fn decided_auth_blocks_feed_later_blocks() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;

        // Power-level conflict: the deeper candidate raises the invite
        // level beyond carol's reach.
        let pl_old = store_state_event(
            &db,
            "$pl1:h",
            "m.room.power_levels",
            "",
            "@alice:h",
            3,
            json!({"users": {"@alice:h": 100}}),
        )
        .await;
        let pl_new = store_state_event(
            &db,
            "$pl2:h",
            "m.room.power_levels",
            "",
            "@alice:h",
            4,
            json!({"users": {"@alice:h": 100}, "invite": 50}),
        )
        .await;

        // Membership conflict judged after power levels: carol's invite is
        // deeper but fails under the decided power levels, so alice's wins.
        let by_alice = store_state_event(
            &db,
            "$bob-by-alice:h",
            "m.room.member",
            "@bob:h",
            "@alice:h",
            5,
            json!({"membership": "invite"}),
        )
        .await;
        let by_carol = store_state_event(
            &db,
            "$bob-by-carol:h",
            "m.room.member",
            "@bob:h",
            "@carol:h",
            6,
            json!({"membership": "invite"}),
        )
        .await;

        combined.extend([pl_old, pl_new, by_alice, by_carol]);
        combined.sort();

        let resolved = resolve_conflicts(&db, &combined, vec![pl_old, pl_new, by_alice, by_carol])
            .await
            .unwrap();

        let pl_winner = resolved.iter().find(|entry| entry.key == pl_new.key).unwrap();
        assert_eq!(pl_winner.event_nid, pl_new.event_nid);
        let member_winner = resolved.iter().find(|entry| entry.key == by_alice.key).unwrap();
        assert_eq!(member_winner.event_nid, by_alice.event_nid);
    }

    #[tokio::test]
    async fn all_rejected_block_falls_back_to_first() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;

        // Neither sender is in the room, so both candidates fail auth.
        let first = store_state_event(
            &db,
            "$jr1:h",
            "m.room.join_rules",
            "",
            "@mallory:h",
            3,
            json!({"join_rule": "public"}),
        )
        .await;
        let second = store_state_event(
            &db,
            "$jr2:h",
            "m.room.join_rules",
            "",
            "@mallory:h",
            7,
            json!({"join_rule": "invite"}),
        )
        .await;
        combined.extend([first, second]);
        combined.sort();

        let resolved = resolve_conflicts(&db, &combined, vec![first, second])
            .await
            .unwrap();
        let winner = resolved.iter().find(|entry| entry.key == first.key).unwrap();
        // First in block order: the shallower candidate.
        assert_eq!(winner.event_nid, first.event_nid);
    }

    #[tokio::test]
    async fn resolution_is_order_independent() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;

        let e1 = store_state_event(
            &db,
            "$a:h",
            "m.room.member",
            "@bob:h",
            "@alice:h",
            4,
            json!({"membership": "invite"}),
        )
        .await;
        let e2 = store_state_event(
            &db,
            "$b:h",
            "m.room.member",
            "@bob:h",
            "@carol:h",
            5,
            json!({"membership": "invite"}),
        )
        .await;
        combined.extend([e1, e2]);
        combined.sort();

        let forwards = resolve_conflicts(&db, &combined, vec![e1, e2]).await.unwrap();
        let backwards = resolve_conflicts(&db, &combined, vec![e2, e1]).await.unwrap();
        assert_eq!(forwards, backwards);
    }

    #[tokio::test]
    async fn unconflicted_state_is_preserved() {
        let db = Database::new(":memory:").await.unwrap();
        let mut combined = base_state(&db).await;
        let unconflicted_len = combined.len();

        let e1 = store_state_event(
            &db,
            "$x:h",
            "m.room.member",
            "@bob:h",
            "@alice:h",
            4,
            json!({"membership": "invite"}),
        )
        .await;
        let e2 = store_state_event(
            &db,
            "$y:h",
            "m.room.member",
            "@bob:h",
            "@carol:h",
            5,
            json!({"membership": "invite"}),
        )
        .await;
        combined.extend([e1, e2]);
        combined.sort();

        let resolved = resolve_conflicts(&db, &combined, vec![e1, e2]).await.unwrap();
        // One entry per key: the base state plus exactly one bob entry.
        assert_eq!(resolved.len(), unconflicted_len + 1);
        let keys: Vec<_> = resolved.iter().map(|entry| entry.key).collect();
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
    }
}
