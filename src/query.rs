//! Read-only query surface.
//!
//! Serves snapshot and latest-edge lookups to external consumers. Readers
//! share the store's connection pool and never mutate interning or state
//! tables; writers and readers interleave only through the store.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet};

use crate::db::Database;
use crate::error::InputError;
use crate::input::{resolve, snapshot};
use crate::types::{EventNid, EventTypeNid, StateEntry, StateKeyNid};

/// A `(event type, state keys)` filter tuple. An empty key list matches
/// every state key of the type.
#[derive(Debug, Clone, Deserialize)]
pub struct StateTuple {
    pub event_type: String,
    #[serde(default)]
    pub state_keys: Vec<String>,
}

/// Request for `POST /query/latestEventsAndState`.
#[derive(Debug, Deserialize)]
pub struct LatestEventsAndStateRequest {
    pub room_id: String,
    #[serde(default)]
    pub state_to_fetch: Vec<StateTuple>,
}

/// A forward-edge event reference.
#[derive(Debug, Serialize)]
pub struct EventReference {
    pub event_id: String,
    /// Hex-encoded SHA-256 reference hash.
    pub reference_sha256: String,
}

/// Response for `POST /query/latestEventsAndState`.
#[derive(Debug, Serialize)]
pub struct LatestEventsAndStateResponse {
    pub room_exists: bool,
    pub latest_events: Vec<EventReference>,
    pub state_events: Vec<Box<RawValue>>,
}

/// Request for `POST /query/stateAfterEvents`.
#[derive(Debug, Deserialize)]
pub struct StateAfterEventsRequest {
    pub event_ids: Vec<String>,
    #[serde(default)]
    pub state_to_fetch: Vec<StateTuple>,
}

/// Response for `POST /query/stateAfterEvents`.
#[derive(Debug, Serialize)]
pub struct StateAfterEventsResponse {
    pub state_events: Vec<Box<RawValue>>,
}

/// Request for `POST /query/backwardEdges`.
#[derive(Debug, Deserialize)]
pub struct BackwardEdgesRequest {
    pub room_id: String,
}

/// Response for `POST /query/backwardEdges`.
#[derive(Debug, Serialize)]
pub struct BackwardEdgesResponse {
    pub event_ids: Vec<String>,
}

/// Request for `POST /query/eventExists`.
#[derive(Debug, Deserialize)]
pub struct EventExistsRequest {
    pub event_ids: Vec<String>,
}

/// Response for `POST /query/eventExists`.
#[derive(Debug, Serialize)]
pub struct EventExistsResponse {
    pub exists: Vec<bool>,
}

/// The query API over the store.
#[derive(Clone)]
pub struct QueryApi {
    db: Database,
}

impl QueryApi {
    /// Create the query API.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current forward edges and (filtered) current state of a room.
    ///
    /// Unknown rooms report `room_exists = false` rather than an error.
    pub async fn latest_events_and_state(
        &self,
        request: &LatestEventsAndStateRequest,
    ) -> Result<LatestEventsAndStateResponse, InputError> {
        let Some(room_nid) = self.db.rooms().lookup_room_nid(&request.room_id).await? else {
            return Ok(LatestEventsAndStateResponse {
                room_exists: false,
                latest_events: Vec::new(),
                state_events: Vec::new(),
            });
        };

        let edges = self.db.rooms().forward_edges(room_nid).await?;
        let latest_events = self
            .db
            .events()
            .events_by_nids(&edges)
            .await?
            .into_iter()
            .map(|row| EventReference {
                event_id: row.event_id,
                reference_sha256: hex::encode(row.reference_sha256),
            })
            .collect();

        let state = match self.db.rooms().current_snapshot(room_nid).await? {
            Some(current) => snapshot::materialize(&self.db, current).await?,
            None => Vec::new(),
        };
        let state_events = self
            .filtered_jsons(state, &request.state_to_fetch)
            .await?;

        Ok(LatestEventsAndStateResponse {
            room_exists: true,
            latest_events,
            state_events,
        })
    }

    /// The room state after the listed events, resolved across them the
    /// same way the input pipeline resolves divergent prev-events.
    pub async fn state_after_events(
        &self,
        request: &StateAfterEventsRequest,
    ) -> Result<StateAfterEventsResponse, InputError> {
        let mut ids = request.event_ids.clone();
        ids.sort();
        ids.dedup();
        let states = self.db.events().state_at_events(&ids).await?;
        let states = snapshot::dedup_prev_states(states);

        let state = match states.as_slice() {
            [] => Vec::new(),
            _ => {
                let combined = snapshot::combine_prev_states(&self.db, &states).await?;
                let conflicted = snapshot::conflicted_entries(&combined);
                if conflicted.is_empty() {
                    combined
                } else {
                    resolve::resolve_conflicts(&self.db, &combined, conflicted).await?
                }
            }
        };

        let state_events = self.filtered_jsons(state, &request.state_to_fetch).await?;
        Ok(StateAfterEventsResponse { state_events })
    }

    /// Events at the backward edge of the room's contiguous graph: the
    /// points a backfill can extend from.
    pub async fn backward_edges(
        &self,
        request: &BackwardEdgesRequest,
    ) -> Result<BackwardEdgesResponse, InputError> {
        let Some(room_nid) = self.db.rooms().lookup_room_nid(&request.room_id).await? else {
            return Ok(BackwardEdgesResponse {
                event_ids: Vec::new(),
            });
        };
        let edges = self.db.rooms().backward_edges(room_nid).await?;
        let event_ids = self
            .db
            .events()
            .events_by_nids(&edges)
            .await?
            .into_iter()
            .map(|row| row.event_id)
            .collect();
        Ok(BackwardEdgesResponse { event_ids })
    }

    /// Which of the given events are stored.
    pub async fn event_exists(
        &self,
        request: &EventExistsRequest,
    ) -> Result<EventExistsResponse, InputError> {
        let found: HashSet<String> = self
            .db
            .events()
            .found_event_ids(&request.event_ids)
            .await?
            .into_iter()
            .collect();
        Ok(EventExistsResponse {
            exists: request
                .event_ids
                .iter()
                .map(|id| found.contains(id))
                .collect(),
        })
    }

    /// Apply the filter tuples to a materialized state and load the
    /// surviving events' JSON.
    async fn filtered_jsons(
        &self,
        state: Vec<StateEntry>,
        state_to_fetch: &[StateTuple],
    ) -> Result<Vec<Box<RawValue>>, InputError> {
        let filter = self.build_filter(state_to_fetch).await?;
        let mut wanted: Vec<EventNid> = state
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .map(|entry| entry.event_nid)
            .collect();
        wanted.sort();
        wanted.dedup();

        let mut jsons = Vec::with_capacity(wanted.len());
        for (_, json) in self.db.events().event_jsons(&wanted).await? {
            let raw = serde_json::from_slice(&json)
                .map_err(roomserver_events::EventError::Json)?;
            jsons.push(raw);
        }
        Ok(jsons)
    }

    /// Resolve filter tuples to interned NIDs. Types or keys the store
    /// has never seen simply match nothing.
    async fn build_filter(&self, state_to_fetch: &[StateTuple]) -> Result<StateFilter, InputError> {
        if state_to_fetch.is_empty() {
            return Ok(StateFilter::All);
        }
        let mut types: HashMap<EventTypeNid, Option<HashSet<StateKeyNid>>> = HashMap::new();
        for tuple in state_to_fetch {
            let Some(type_nid) = self
                .db
                .interner()
                .lookup_event_type_nid(&tuple.event_type)
                .await?
            else {
                continue;
            };
            if tuple.state_keys.is_empty() {
                types.insert(type_nid, None);
                continue;
            }
            let keys: Vec<StateKeyNid> = self
                .db
                .interner()
                .lookup_state_key_nids(&tuple.state_keys)
                .await?
                .into_iter()
                .map(|(_, nid)| nid)
                .collect();
            if let Some(filter) = types.entry(type_nid).or_insert_with(|| Some(HashSet::new())) {
                filter.extend(keys);
            }
        }
        Ok(StateFilter::Tuples(types))
    }
}

enum StateFilter {
    All,
    Tuples(HashMap<EventTypeNid, Option<HashSet<StateKeyNid>>>),
}

impl StateFilter {
    fn matches(&self, entry: &StateEntry) -> bool {
        match self {
            Self::All => true,
            Self::Tuples(types) => match types.get(&entry.key.event_type_nid) {
                None => false,
                Some(None) => true,
                Some(Some(keys)) => keys.contains(&entry.key.event_state_key_nid),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputEvent, InputHandler, InputKind};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn populated_room() -> Database {
        let db = Database::new(":memory:").await.unwrap();
        let handler = InputHandler::new(db.clone());
        let cancel = CancellationToken::new();

        let records = [
            (
                InputKind::Outlier,
                json!({
                    "event_id": "$create:h", "room_id": "!r:h", "sender": "@alice:h",
                    "type": "m.room.create", "state_key": "", "depth": 1,
                    "prev_events": [], "content": {}
                }),
            ),
            (
                InputKind::Join,
                json!({
                    "event_id": "$alice:h", "room_id": "!r:h", "sender": "@alice:h",
                    "type": "m.room.member", "state_key": "@alice:h", "depth": 2,
                    "prev_events": ["$create:h"], "content": {"membership": "join"}
                }),
            ),
            (
                InputKind::New,
                json!({
                    "event_id": "$msg:h", "room_id": "!r:h", "sender": "@alice:h",
                    "type": "m.room.message", "depth": 3,
                    "prev_events": ["$alice:h"], "content": {"body": "hi"}
                }),
            ),
        ];
        for (kind, event) in records {
            let input = InputEvent {
                kind,
                event_json: serde_json::value::RawValue::from_string(event.to_string()).unwrap(),
                state_event_ids: None,
            };
            handler.handle(&input, &cancel).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn unknown_room_reports_not_exists() {
        let db = Database::new(":memory:").await.unwrap();
        let api = QueryApi::new(db);
        let response = api
            .latest_events_and_state(&LatestEventsAndStateRequest {
                room_id: "!nowhere:h".into(),
                state_to_fetch: Vec::new(),
            })
            .await
            .unwrap();
        assert!(!response.room_exists);
        assert!(response.latest_events.is_empty());
        assert!(response.state_events.is_empty());
    }

    #[tokio::test]
    async fn latest_events_and_full_state() {
        let api = QueryApi::new(populated_room().await);
        let response = api
            .latest_events_and_state(&LatestEventsAndStateRequest {
                room_id: "!r:h".into(),
                state_to_fetch: Vec::new(),
            })
            .await
            .unwrap();

        assert!(response.room_exists);
        // The message is the only tip.
        assert_eq!(response.latest_events.len(), 1);
        assert_eq!(response.latest_events[0].event_id, "$msg:h");
        assert_eq!(response.latest_events[0].reference_sha256.len(), 64);
        // Current state: create + alice's membership.
        assert_eq!(response.state_events.len(), 2);
    }

    #[tokio::test]
    async fn filter_tuples_restrict_state() {
        let api = QueryApi::new(populated_room().await);
        let response = api
            .latest_events_and_state(&LatestEventsAndStateRequest {
                room_id: "!r:h".into(),
                state_to_fetch: vec![StateTuple {
                    event_type: "m.room.member".into(),
                    state_keys: vec!["@alice:h".into()],
                }],
            })
            .await
            .unwrap();
        assert_eq!(response.state_events.len(), 1);
        assert!(response.state_events[0].get().contains("$alice:h"));

        let response = api
            .latest_events_and_state(&LatestEventsAndStateRequest {
                room_id: "!r:h".into(),
                state_to_fetch: vec![StateTuple {
                    event_type: "m.room.topic".into(),
                    state_keys: Vec::new(),
                }],
            })
            .await
            .unwrap();
        assert!(response.state_events.is_empty());
    }

    #[tokio::test]
    async fn state_after_events_overlays_the_event_itself() {
        let api = QueryApi::new(populated_room().await);
        let response = api
            .state_after_events(&StateAfterEventsRequest {
                event_ids: vec!["$alice:h".into()],
                state_to_fetch: Vec::new(),
            })
            .await
            .unwrap();
        // State after alice's join: the create event plus the join itself.
        assert_eq!(response.state_events.len(), 2);
        assert!(
            response
                .state_events
                .iter()
                .any(|raw| raw.get().contains("$alice:h"))
        );
    }

    #[tokio::test]
    async fn backward_edges_list_unresolved_backfill_points() {
        let db = populated_room().await;
        let handler = InputHandler::new(db.clone());
        let cancel = CancellationToken::new();

        // A backfilled event with explicit prior state and an unknown prev.
        let input = InputEvent {
            kind: InputKind::Backfill,
            event_json: serde_json::value::RawValue::from_string(
                json!({
                    "event_id": "$old:h", "room_id": "!r:h", "sender": "@alice:h",
                    "type": "m.room.message", "depth": 1,
                    "prev_events": ["$gone:h"], "content": {}
                })
                .to_string(),
            )
            .unwrap(),
            state_event_ids: Some(vec!["$create:h".to_string()]),
        };
        handler.handle(&input, &cancel).await.unwrap();

        let api = QueryApi::new(db);
        let response = api
            .backward_edges(&BackwardEdgesRequest {
                room_id: "!r:h".into(),
            })
            .await
            .unwrap();
        assert_eq!(response.event_ids, vec!["$old:h".to_string()]);

        let response = api
            .backward_edges(&BackwardEdgesRequest {
                room_id: "!nowhere:h".into(),
            })
            .await
            .unwrap();
        assert!(response.event_ids.is_empty());
    }

    #[tokio::test]
    async fn event_exists_answers_in_request_order() {
        let api = QueryApi::new(populated_room().await);
        let response = api
            .event_exists(&EventExistsRequest {
                event_ids: vec!["$msg:h".into(), "$gone:h".into(), "$create:h".into()],
            })
            .await
            .unwrap();
        assert_eq!(response.exists, vec![true, false, true]);
    }
}
