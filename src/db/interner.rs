//! Interning repository: stable numeric IDs for event types and state keys.
//!
//! Allocation is serialized by a named lock per namespace with a
//! double-check after locking, so two writers racing on the same unseen
//! string get the same NID. Lookups are lock-free reads.

use sqlx::SqlitePool;

use super::{DbError, StoreLocks, placeholders};
use crate::types::{EventTypeNid, StateKeyNid};

/// Repository for the interning namespaces.
pub struct InternRepository<'a> {
    pool: &'a SqlitePool,
    locks: &'a StoreLocks,
}

impl<'a> InternRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool, locks: &'a StoreLocks) -> Self {
        Self { pool, locks }
    }

    /// Return the NID for an event type, allocating one if it is unseen.
    pub async fn assign_event_type_nid(&self, event_type: &str) -> Result<EventTypeNid, DbError> {
        if let Some(nid) = self.lookup_event_type_nid(event_type).await? {
            return Ok(nid);
        }
        let _guard = self.locks.event_types.lock().await;
        // Another writer may have allocated while we waited for the lock.
        if let Some(nid) = self.lookup_event_type_nid(event_type).await? {
            return Ok(nid);
        }
        let (nid,): (i64,) = sqlx::query_as(
            "INSERT INTO event_types (event_type) VALUES (?)
             ON CONFLICT (event_type) DO UPDATE SET event_type = excluded.event_type
             RETURNING event_type_nid",
        )
        .bind(event_type)
        .fetch_one(self.pool)
        .await?;
        Ok(EventTypeNid(nid))
    }

    /// Return the NID for a state key, allocating one if it is unseen.
    pub async fn assign_state_key_nid(&self, state_key: &str) -> Result<StateKeyNid, DbError> {
        if let Some(nid) = self.lookup_state_key_nid(state_key).await? {
            return Ok(nid);
        }
        let _guard = self.locks.state_keys.lock().await;
        if let Some(nid) = self.lookup_state_key_nid(state_key).await? {
            return Ok(nid);
        }
        let (nid,): (i64,) = sqlx::query_as(
            "INSERT INTO event_state_keys (event_state_key) VALUES (?)
             ON CONFLICT (event_state_key) DO UPDATE SET event_state_key = excluded.event_state_key
             RETURNING event_state_key_nid",
        )
        .bind(state_key)
        .fetch_one(self.pool)
        .await?;
        Ok(StateKeyNid(nid))
    }

    /// Look up the NID for an event type without allocating.
    pub async fn lookup_event_type_nid(
        &self,
        event_type: &str,
    ) -> Result<Option<EventTypeNid>, DbError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT event_type_nid FROM event_types WHERE event_type = ?")
                .bind(event_type)
                .fetch_optional(self.pool)
                .await?;
        Ok(row.map(|(nid,)| EventTypeNid(nid)))
    }

    /// Look up the NID for a state key without allocating.
    pub async fn lookup_state_key_nid(
        &self,
        state_key: &str,
    ) -> Result<Option<StateKeyNid>, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT event_state_key_nid FROM event_state_keys WHERE event_state_key = ?",
        )
        .bind(state_key)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(|(nid,)| StateKeyNid(nid)))
    }

    /// Look up NIDs for a batch of state keys without allocating.
    ///
    /// Unknown keys are simply absent from the result.
    pub async fn lookup_state_key_nids(
        &self,
        state_keys: &[String],
    ) -> Result<Vec<(String, StateKeyNid)>, DbError> {
        if state_keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT event_state_key, event_state_key_nid FROM event_state_keys
             WHERE event_state_key IN ({})",
            placeholders(state_keys.len())
        );
        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        for key in state_keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(key, nid)| (key, StateKeyNid(nid)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use crate::types::{EMPTY_STATE_KEY_NID, EVENT_TYPE_MEMBER_NID, EventTypeNid};

    #[tokio::test]
    async fn reserved_types_resolve_without_allocation() {
        let db = Database::new(":memory:").await.unwrap();
        let nid = db.interner().assign_event_type_nid("m.room.member").await.unwrap();
        assert_eq!(nid, EVENT_TYPE_MEMBER_NID);

        let nid = db.interner().assign_state_key_nid("").await.unwrap();
        assert_eq!(nid, EMPTY_STATE_KEY_NID);
    }

    #[tokio::test]
    async fn new_types_allocate_past_the_reserved_range() {
        let db = Database::new(":memory:").await.unwrap();
        let nid = db
            .interner()
            .assign_event_type_nid("m.room.message")
            .await
            .unwrap();
        assert!(nid > EventTypeNid(5));

        // Idempotent on re-assignment.
        let again = db
            .interner()
            .assign_event_type_nid("m.room.message")
            .await
            .unwrap();
        assert_eq!(nid, again);
    }

    #[tokio::test]
    async fn concurrent_assignment_agrees_on_one_nid() {
        let db = Database::new(":memory:").await.unwrap();
        let a = db.clone();
        let b = db.clone();
        let (x, y) = tokio::join!(
            async move { a.interner().assign_state_key_nid("@alice:h").await.unwrap() },
            async move { b.interner().assign_state_key_nid("@alice:h").await.unwrap() },
        );
        assert_eq!(x, y);
    }

    #[tokio::test]
    async fn lookup_does_not_allocate() {
        let db = Database::new(":memory:").await.unwrap();
        assert!(
            db.interner()
                .lookup_event_type_nid("m.room.topic")
                .await
                .unwrap()
                .is_none()
        );

        let found = db
            .interner()
            .lookup_state_key_nids(&["".to_string(), "@nobody:h".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "");
    }
}
