//! Event repository: raw event bodies and their graph metadata.

use sqlx::SqlitePool;

use super::{DbError, placeholders};
use crate::types::{EventNid, EventTypeNid, RoomNid, SnapshotNid, StateAtEvent, StateEntry, StateKeyNid, StateKeyPair};

/// The result of persisting an event.
#[derive(Debug, Clone, Copy)]
pub struct AddedEvent {
    /// The NID assigned to the event (the existing one on duplicates).
    pub event_nid: EventNid,
    /// The pre-event snapshot, if one was already bound to the event.
    pub before_snapshot: Option<SnapshotNid>,
}

/// An event row joined with its raw JSON.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// The event's NID.
    pub event_nid: EventNid,
    /// The event's string ID.
    pub event_id: String,
    /// SHA-256 reference hash over the canonicalized event.
    pub reference_sha256: Vec<u8>,
    /// The raw event JSON.
    pub event_json: Vec<u8>,
}

/// Repository for events and their JSON bodies.
pub struct EventRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EventRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist an event, idempotent on event ID.
    ///
    /// A duplicate insert returns the existing NID and leaves the stored
    /// JSON untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_event(
        &self,
        event_id: &str,
        room_nid: RoomNid,
        depth: i64,
        event_type_nid: EventTypeNid,
        event_state_key_nid: Option<StateKeyNid>,
        reference_sha256: &[u8],
        event_json: &[u8],
    ) -> Result<AddedEvent, DbError> {
        let mut tx = self.pool.begin().await?;

        let (event_nid, snapshot_nid): (i64, i64) = sqlx::query_as(
            "INSERT INTO events
                 (event_id, room_nid, depth, event_type_nid, event_state_key_nid, reference_sha256)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (event_id) DO UPDATE SET event_id = excluded.event_id
             RETURNING event_nid, state_snapshot_nid",
        )
        .bind(event_id)
        .bind(room_nid.0)
        .bind(depth)
        .bind(event_type_nid.0)
        .bind(event_state_key_nid.map(|nid| nid.0))
        .bind(reference_sha256)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO event_json (event_nid, event_json) VALUES (?, ?)")
            .bind(event_nid)
            .bind(event_json)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(AddedEvent {
            event_nid: EventNid(event_nid),
            before_snapshot: (snapshot_nid != 0).then_some(SnapshotNid(snapshot_nid)),
        })
    }

    /// Fetch raw JSON for a batch of event NIDs, sorted by NID.
    pub async fn event_jsons(
        &self,
        event_nids: &[EventNid],
    ) -> Result<Vec<(EventNid, Vec<u8>)>, DbError> {
        if event_nids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT event_nid, event_json FROM event_json
             WHERE event_nid IN ({}) ORDER BY event_nid",
            placeholders(event_nids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, Vec<u8>)>(&sql);
        for nid in event_nids {
            query = query.bind(nid.0);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(nid, json)| (EventNid(nid), json))
            .collect())
    }

    /// Fetch event rows with their JSON for a batch of NIDs, sorted by NID.
    ///
    /// Every requested NID must exist; a missing row means the store has
    /// lost an event another table still references.
    pub async fn events_by_nids(
        &self,
        event_nids: &[EventNid],
    ) -> Result<Vec<StoredEvent>, DbError> {
        if event_nids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT e.event_nid, e.event_id, e.reference_sha256, j.event_json
             FROM events e JOIN event_json j ON j.event_nid = e.event_nid
             WHERE e.event_nid IN ({}) ORDER BY e.event_nid",
            placeholders(event_nids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, String, Vec<u8>, Vec<u8>)>(&sql);
        for nid in event_nids {
            query = query.bind(nid.0);
        }
        let rows = query.fetch_all(self.pool).await?;

        let mut unique: Vec<i64> = event_nids.iter().map(|nid| nid.0).collect();
        unique.sort_unstable();
        unique.dedup();
        if rows.len() != unique.len() {
            return Err(DbError::Corrupt(format!(
                "requested {} events, found {}",
                unique.len(),
                rows.len()
            )));
        }

        Ok(rows
            .into_iter()
            .map(|(nid, event_id, hash, json)| StoredEvent {
                event_nid: EventNid(nid),
                event_id,
                reference_sha256: hash,
                event_json: json,
            })
            .collect())
    }

    /// Bind the pre-event snapshot to an event. Write-once.
    ///
    /// Rebinding the same value is a no-op (redelivered records); binding a
    /// different value means the state at an event changed, which the store
    /// never allows.
    pub async fn set_before_snapshot(
        &self,
        event_nid: EventNid,
        snapshot: SnapshotNid,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE events SET state_snapshot_nid = ?
             WHERE event_nid = ? AND state_snapshot_nid IN (0, ?)",
        )
        .bind(snapshot.0)
        .bind(event_nid.0)
        .bind(snapshot.0)
        .execute(self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::Corrupt(format!(
                "state at event {event_nid} would change from its assigned snapshot"
            )));
        }
        Ok(())
    }

    /// Look up the recorded state at each of the given events.
    ///
    /// Only events with an assigned pre-event snapshot are returned;
    /// callers detect missing ancestry by comparing lengths.
    pub async fn state_at_events(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<StateAtEvent>, DbError> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT event_nid, event_type_nid, event_state_key_nid, state_snapshot_nid
             FROM events WHERE event_id IN ({}) AND state_snapshot_nid != 0
             ORDER BY event_nid",
            placeholders(event_ids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, Option<i64>, i64)>(&sql);
        for id in event_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(event_nid, type_nid, state_key_nid, snapshot_nid)| StateAtEvent {
                event_nid: EventNid(event_nid),
                state_entry: state_key_nid.map(|key_nid| StateEntry {
                    key: StateKeyPair::new(EventTypeNid(type_nid), StateKeyNid(key_nid)),
                    event_nid: EventNid(event_nid),
                }),
                before_snapshot: Some(SnapshotNid(snapshot_nid)),
            })
            .collect())
    }

    /// Resolve state-event IDs to state entries.
    ///
    /// Non-state and unknown events are absent from the result; callers
    /// detect both by comparing lengths.
    pub async fn state_events(&self, event_ids: &[String]) -> Result<Vec<StateEntry>, DbError> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT event_nid, event_type_nid, event_state_key_nid
             FROM events WHERE event_id IN ({}) AND event_state_key_nid IS NOT NULL
             ORDER BY event_nid",
            placeholders(event_ids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, i64)>(&sql);
        for id in event_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(event_nid, type_nid, key_nid)| StateEntry {
                key: StateKeyPair::new(EventTypeNid(type_nid), StateKeyNid(key_nid)),
                event_nid: EventNid(event_nid),
            })
            .collect())
    }

    /// Stored `m.room.create` events among `event_ids` that still lack a
    /// pre-event snapshot.
    ///
    /// These are outliers that root a room's graph: when a later event
    /// references one, the input handler assigns it the empty state.
    pub async fn unrooted_creates(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<(EventNid, RoomNid, Vec<u8>)>, DbError> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT e.event_nid, e.room_nid, j.event_json
             FROM events e JOIN event_json j ON j.event_nid = e.event_nid
             WHERE e.event_id IN ({})
               AND e.state_snapshot_nid = 0 AND e.event_type_nid = 1
             ORDER BY e.event_nid",
            placeholders(event_ids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, Vec<u8>)>(&sql);
        for id in event_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(event_nid, room_nid, json)| (EventNid(event_nid), RoomNid(room_nid), json))
            .collect())
    }

    /// Which of the given event IDs are stored.
    pub async fn found_event_ids(&self, event_ids: &[String]) -> Result<Vec<String>, DbError> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT event_id FROM events WHERE event_id IN ({})",
            placeholders(event_ids.len())
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql);
        for id in event_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use crate::types::{EventNid, EventTypeNid, RoomNid, SnapshotNid, StateKeyNid};

    async fn add(
        db: &Database,
        event_id: &str,
        state_key: Option<StateKeyNid>,
    ) -> super::AddedEvent {
        db.events()
            .add_event(
                event_id,
                RoomNid(1),
                1,
                EventTypeNid(1),
                state_key,
                &[0u8; 32],
                br#"{"event_id":"x"}"#,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_insert_returns_same_nid_and_keeps_json() {
        let db = Database::new(":memory:").await.unwrap();
        let first = add(&db, "$e:h", None).await;

        let second = db
            .events()
            .add_event(
                "$e:h",
                RoomNid(1),
                1,
                EventTypeNid(1),
                None,
                &[1u8; 32],
                br#"{"event_id":"overwritten"}"#,
            )
            .await
            .unwrap();

        assert_eq!(first.event_nid, second.event_nid);
        let jsons = db.events().event_jsons(&[first.event_nid]).await.unwrap();
        assert_eq!(jsons[0].1, br#"{"event_id":"x"}"#);
    }

    #[tokio::test]
    async fn event_nids_are_monotonic() {
        let db = Database::new(":memory:").await.unwrap();
        let a = add(&db, "$a:h", None).await;
        let b = add(&db, "$b:h", None).await;
        assert!(b.event_nid > a.event_nid);
    }

    #[tokio::test]
    async fn snapshot_binding_is_write_once() {
        let db = Database::new(":memory:").await.unwrap();
        let added = add(&db, "$e:h", None).await;
        assert_eq!(added.before_snapshot, None);

        db.events()
            .set_before_snapshot(added.event_nid, SnapshotNid(3))
            .await
            .unwrap();
        // Same value again is fine (redelivery).
        db.events()
            .set_before_snapshot(added.event_nid, SnapshotNid(3))
            .await
            .unwrap();
        // A different value is corruption.
        assert!(
            db.events()
                .set_before_snapshot(added.event_nid, SnapshotNid(4))
                .await
                .is_err()
        );

        let again = add(&db, "$e:h", None).await;
        assert_eq!(again.before_snapshot, Some(SnapshotNid(3)));
    }

    #[tokio::test]
    async fn state_at_events_requires_assigned_snapshots() {
        let db = Database::new(":memory:").await.unwrap();
        let state = add(&db, "$s:h", Some(StateKeyNid(1))).await;
        add(&db, "$pending:h", None).await;

        db.events()
            .set_before_snapshot(state.event_nid, SnapshotNid(1))
            .await
            .unwrap();

        let at = db
            .events()
            .state_at_events(&["$s:h".to_string(), "$pending:h".to_string()])
            .await
            .unwrap();
        assert_eq!(at.len(), 1);
        assert_eq!(at[0].event_nid, state.event_nid);
        assert_eq!(at[0].before_snapshot, Some(SnapshotNid(1)));
        assert!(at[0].state_entry.is_some());
    }

    #[tokio::test]
    async fn state_events_skips_non_state_events() {
        let db = Database::new(":memory:").await.unwrap();
        add(&db, "$state:h", Some(StateKeyNid(1))).await;
        add(&db, "$message:h", None).await;

        let entries = db
            .events()
            .state_events(&["$state:h".to_string(), "$message:h".to_string()])
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn events_by_nids_reports_missing_rows_as_corruption() {
        let db = Database::new(":memory:").await.unwrap();
        let added = add(&db, "$e:h", None).await;
        assert!(
            db.events()
                .events_by_nids(&[added.event_nid, EventNid(999)])
                .await
                .is_err()
        );
    }
}
