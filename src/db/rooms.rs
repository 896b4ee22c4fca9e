//! Room repository: room interning, activity state, and DAG edges.

use sqlx::SqlitePool;
use std::sync::Arc;

use super::{DbError, StoreLocks, placeholders};
use crate::types::{EventNid, RoomNid, SnapshotNid};

/// Repository for rooms and their graph edges.
pub struct RoomRepository<'a> {
    pool: &'a SqlitePool,
    locks: &'a StoreLocks,
}

impl<'a> RoomRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool, locks: &'a StoreLocks) -> Self {
        Self { pool, locks }
    }

    /// Look up the NID for a room ID. Returns `None` for unknown rooms.
    pub async fn lookup_room_nid(&self, room_id: &str) -> Result<Option<RoomNid>, DbError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT room_nid FROM rooms WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(|(nid,)| RoomNid(nid)))
    }

    /// Return the NID for a room, creating the room if it is unseen.
    ///
    /// Creation is serialized per room ID with a double-check after
    /// locking, so concurrent bootstraps agree on one NID.
    pub async fn assign_room_nid(&self, room_id: &str) -> Result<RoomNid, DbError> {
        if let Some(nid) = self.lookup_room_nid(room_id).await? {
            return Ok(nid);
        }
        let lock = self
            .locks
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(nid) = self.lookup_room_nid(room_id).await? {
            return Ok(nid);
        }
        let (nid,): (i64,) = sqlx::query_as(
            "INSERT INTO rooms (room_id) VALUES (?)
             ON CONFLICT (room_id) DO UPDATE SET room_id = excluded.room_id
             RETURNING room_nid",
        )
        .bind(room_id)
        .fetch_one(self.pool)
        .await?;
        Ok(RoomNid(nid))
    }

    /// Whether the server holds an active joined state for the room.
    pub async fn is_active(&self, room_nid: RoomNid) -> Result<bool, DbError> {
        let (active,): (i64,) = sqlx::query_as("SELECT is_active FROM rooms WHERE room_nid = ?")
            .bind(room_nid.0)
            .fetch_one(self.pool)
            .await?;
        Ok(active != 0)
    }

    /// Mark the room active.
    pub async fn set_active(&self, room_nid: RoomNid) -> Result<(), DbError> {
        sqlx::query("UPDATE rooms SET is_active = 1 WHERE room_nid = ?")
            .bind(room_nid.0)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// The snapshot of the room state after the most recent commit, if any.
    pub async fn current_snapshot(&self, room_nid: RoomNid) -> Result<Option<SnapshotNid>, DbError> {
        let (nid,): (i64,) =
            sqlx::query_as("SELECT current_snapshot_nid FROM rooms WHERE room_nid = ?")
                .bind(room_nid.0)
                .fetch_one(self.pool)
                .await?;
        Ok((nid != 0).then_some(SnapshotNid(nid)))
    }

    /// Record the snapshot of the room state after the latest commit.
    pub async fn set_current_snapshot(
        &self,
        room_nid: RoomNid,
        snapshot: SnapshotNid,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE rooms SET current_snapshot_nid = ? WHERE room_nid = ?")
            .bind(snapshot.0)
            .bind(room_nid.0)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Number of rooms known to the store.
    pub async fn count(&self) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    // --- DAG edges ---

    /// The forward edges (tips) of the room's contiguous graph.
    pub async fn forward_edges(&self, room_nid: RoomNid) -> Result<Vec<EventNid>, DbError> {
        self.edges(room_nid, false).await
    }

    /// The backward edges (roots with unresolved ancestry).
    pub async fn backward_edges(&self, room_nid: RoomNid) -> Result<Vec<EventNid>, DbError> {
        self.edges(room_nid, true).await
    }

    async fn edges(&self, room_nid: RoomNid, backward: bool) -> Result<Vec<EventNid>, DbError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT event_nid FROM room_edges
             WHERE room_nid = ? AND backward = ? ORDER BY event_nid",
        )
        .bind(room_nid.0)
        .bind(backward as i64)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(nid,)| EventNid(nid)).collect())
    }

    /// Add a forward edge for an event.
    pub async fn add_forward_edge(
        &self,
        room_nid: RoomNid,
        event_nid: EventNid,
    ) -> Result<(), DbError> {
        self.add_edge(room_nid, event_nid, false).await
    }

    /// Add a backward edge for an event.
    pub async fn add_backward_edge(
        &self,
        room_nid: RoomNid,
        event_nid: EventNid,
    ) -> Result<(), DbError> {
        self.add_edge(room_nid, event_nid, true).await
    }

    async fn add_edge(
        &self,
        room_nid: RoomNid,
        event_nid: EventNid,
        backward: bool,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT OR IGNORE INTO room_edges (room_nid, event_nid, backward) VALUES (?, ?, ?)",
        )
        .bind(room_nid.0)
        .bind(event_nid.0)
        .bind(backward as i64)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove the forward edges for the events with the given IDs.
    ///
    /// Unknown IDs are ignored: an event may reference ancestors that were
    /// never tips here.
    pub async fn remove_forward_edges(
        &self,
        room_nid: RoomNid,
        event_ids: &[String],
    ) -> Result<(), DbError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM room_edges WHERE room_nid = ? AND backward = 0 AND event_nid IN
             (SELECT event_nid FROM events WHERE event_id IN ({}))",
            placeholders(event_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(room_nid.0);
        for id in event_ids {
            query = query.bind(id);
        }
        query.execute(self.pool).await?;
        Ok(())
    }

    /// Remove a backward edge once its ancestry has been resolved.
    pub async fn remove_backward_edge(
        &self,
        room_nid: RoomNid,
        event_nid: EventNid,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM room_edges WHERE room_nid = ? AND event_nid = ? AND backward = 1")
            .bind(room_nid.0)
            .bind(event_nid.0)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    // --- prev_event reference tracking ---

    /// Record the prev_event references of a committed event.
    pub async fn record_event_refs(
        &self,
        room_nid: RoomNid,
        by_event_nid: EventNid,
        prev_event_ids: &[String],
    ) -> Result<(), DbError> {
        for prev in prev_event_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO event_refs (room_nid, by_event_nid, prev_event_id)
                 VALUES (?, ?, ?)",
            )
            .bind(room_nid.0)
            .bind(by_event_nid.0)
            .bind(prev)
            .execute(self.pool)
            .await?;
        }
        Ok(())
    }

    /// Whether any committed event lists this event ID as a prev_event.
    pub async fn is_referenced(&self, room_nid: RoomNid, event_id: &str) -> Result<bool, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM event_refs WHERE room_nid = ? AND prev_event_id = ? LIMIT 1",
        )
        .bind(room_nid.0)
        .bind(event_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Events that list the given event ID as a prev_event.
    pub async fn referencers_of(
        &self,
        room_nid: RoomNid,
        event_id: &str,
    ) -> Result<Vec<EventNid>, DbError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT by_event_nid FROM event_refs
             WHERE room_nid = ? AND prev_event_id = ? ORDER BY by_event_nid",
        )
        .bind(room_nid.0)
        .bind(event_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(nid,)| EventNid(nid)).collect())
    }

    /// How many of an event's recorded prev_events are still unknown.
    pub async fn missing_prev_count(&self, by_event_nid: EventNid) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM event_refs er
             WHERE er.by_event_nid = ?
               AND NOT EXISTS (SELECT 1 FROM events e WHERE e.event_id = er.prev_event_id)",
        )
        .bind(by_event_nid.0)
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }
}
