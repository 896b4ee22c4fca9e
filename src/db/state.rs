//! State-snapshot repository.
//!
//! A snapshot is an ordered list of immutable state-data blocks; the
//! semantic value is the union of the blocks with later blocks overriding
//! earlier ones per state key. Blocks are shared by reference between
//! snapshots, which is what makes state storage delta-encoded.

use sqlx::SqlitePool;

use super::{DbError, placeholders};
use crate::types::{
    EventNid, EventTypeNid, RoomNid, SnapshotNid, StateBlockNid, StateEntry, StateKeyNid,
    StateKeyPair,
};

/// Repository for snapshots and state-data blocks.
pub struct StateRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StateRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Write a snapshot.
    ///
    /// If `new_entries` is non-empty it is first written as a fresh block
    /// whose NID is appended to `base_block_nids`; the combined list is the
    /// snapshot's block list. Entries are stored sorted and de-duplicated.
    pub async fn write_snapshot(
        &self,
        room_nid: RoomNid,
        base_block_nids: &[StateBlockNid],
        new_entries: &[StateEntry],
    ) -> Result<SnapshotNid, DbError> {
        let mut tx = self.pool.begin().await?;

        let mut block_nids: Vec<i64> = base_block_nids.iter().map(|nid| nid.0).collect();

        if !new_entries.is_empty() {
            let mut entries = new_entries.to_vec();
            entries.sort();
            entries.dedup();

            let (block_nid,): (i64,) = sqlx::query_as(
                "UPDATE state_data_seq SET next_state_data_nid = next_state_data_nid + 1
                 RETURNING next_state_data_nid",
            )
            .fetch_one(&mut *tx)
            .await?;
            for entry in &entries {
                sqlx::query(
                    "INSERT INTO state_data
                         (state_data_nid, event_type_nid, event_state_key_nid, event_nid)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(block_nid)
                .bind(entry.key.event_type_nid.0)
                .bind(entry.key.event_state_key_nid.0)
                .bind(entry.event_nid.0)
                .execute(&mut *tx)
                .await?;
            }
            block_nids.push(block_nid);
        }

        let encoded = serde_json::to_string(&block_nids)
            .map_err(|e| DbError::Corrupt(format!("unencodable block list: {e}")))?;
        let (snapshot_nid,): (i64,) = sqlx::query_as(
            "INSERT INTO state (room_nid, state_data_nids) VALUES (?, ?)
             RETURNING state_snapshot_nid",
        )
        .bind(room_nid.0)
        .bind(encoded)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SnapshotNid(snapshot_nid))
    }

    /// Fetch the block lists of the given snapshots, sorted by snapshot NID.
    ///
    /// Every requested snapshot must exist; events only ever reference
    /// snapshots the store wrote.
    pub async fn blocks_of(
        &self,
        snapshot_nids: &[SnapshotNid],
    ) -> Result<Vec<(SnapshotNid, Vec<StateBlockNid>)>, DbError> {
        if snapshot_nids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT state_snapshot_nid, state_data_nids FROM state
             WHERE state_snapshot_nid IN ({}) ORDER BY state_snapshot_nid",
            placeholders(snapshot_nids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
        for nid in snapshot_nids {
            query = query.bind(nid.0);
        }
        let rows = query.fetch_all(self.pool).await?;

        let mut unique: Vec<i64> = snapshot_nids.iter().map(|nid| nid.0).collect();
        unique.sort_unstable();
        unique.dedup();
        if rows.len() != unique.len() {
            return Err(DbError::Corrupt(format!(
                "requested {} snapshots, found {}",
                unique.len(),
                rows.len()
            )));
        }

        rows.into_iter()
            .map(|(nid, encoded)| {
                let blocks: Vec<i64> = serde_json::from_str(&encoded).map_err(|e| {
                    DbError::Corrupt(format!("undecodable block list for snapshot {nid}: {e}"))
                })?;
                Ok((
                    SnapshotNid(nid),
                    blocks.into_iter().map(StateBlockNid).collect(),
                ))
            })
            .collect()
    }

    /// Fetch the entries of the given blocks, sorted by block NID; each
    /// block's entries are sorted by state key.
    pub async fn block_entries(
        &self,
        block_nids: &[StateBlockNid],
    ) -> Result<Vec<(StateBlockNid, Vec<StateEntry>)>, DbError> {
        if block_nids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT state_data_nid, event_type_nid, event_state_key_nid, event_nid
             FROM state_data WHERE state_data_nid IN ({})
             ORDER BY state_data_nid, event_type_nid, event_state_key_nid, event_nid",
            placeholders(block_nids.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, i64, i64)>(&sql);
        for nid in block_nids {
            query = query.bind(nid.0);
        }
        let rows = query.fetch_all(self.pool).await?;

        let mut results: Vec<(StateBlockNid, Vec<StateEntry>)> = Vec::new();
        for (block_nid, type_nid, key_nid, event_nid) in rows {
            let entry = StateEntry {
                key: StateKeyPair::new(EventTypeNid(type_nid), StateKeyNid(key_nid)),
                event_nid: EventNid(event_nid),
            };
            match results.last_mut() {
                Some((nid, entries)) if nid.0 == block_nid => entries.push(entry),
                _ => results.push((StateBlockNid(block_nid), vec![entry])),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use crate::types::{EventNid, EventTypeNid, RoomNid, StateEntry, StateKeyNid, StateKeyPair};

    fn entry(t: i64, k: i64, e: i64) -> StateEntry {
        StateEntry {
            key: StateKeyPair::new(EventTypeNid(t), StateKeyNid(k)),
            event_nid: EventNid(e),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let db = Database::new(":memory:").await.unwrap();
        let entries = vec![entry(5, 2, 9), entry(1, 1, 3), entry(5, 2, 9)];

        let snapshot = db
            .state()
            .write_snapshot(RoomNid(1), &[], &entries)
            .await
            .unwrap();

        let blocks = db.state().blocks_of(&[snapshot]).await.unwrap();
        assert_eq!(blocks.len(), 1);
        let (_, block_nids) = &blocks[0];
        assert_eq!(block_nids.len(), 1);

        let block_entries = db.state().block_entries(block_nids).await.unwrap();
        // Sorted and de-duplicated on write.
        assert_eq!(block_entries[0].1, vec![entry(1, 1, 3), entry(5, 2, 9)]);
    }

    #[tokio::test]
    async fn snapshots_share_base_blocks() {
        let db = Database::new(":memory:").await.unwrap();
        let base = db
            .state()
            .write_snapshot(RoomNid(1), &[], &[entry(1, 1, 1)])
            .await
            .unwrap();
        let base_blocks = db.state().blocks_of(&[base]).await.unwrap()[0].1.clone();

        let delta = db
            .state()
            .write_snapshot(RoomNid(1), &base_blocks, &[entry(2, 1, 2)])
            .await
            .unwrap();
        let delta_blocks = db.state().blocks_of(&[delta]).await.unwrap()[0].1.clone();

        assert_eq!(delta_blocks.len(), 2);
        assert_eq!(delta_blocks[0], base_blocks[0]);
    }

    #[tokio::test]
    async fn empty_delta_reuses_base_blocks_without_writing() {
        let db = Database::new(":memory:").await.unwrap();
        let base = db
            .state()
            .write_snapshot(RoomNid(1), &[], &[entry(1, 1, 1)])
            .await
            .unwrap();
        let base_blocks = db.state().blocks_of(&[base]).await.unwrap()[0].1.clone();

        let copy = db
            .state()
            .write_snapshot(RoomNid(1), &base_blocks, &[])
            .await
            .unwrap();
        let copy_blocks = db.state().blocks_of(&[copy]).await.unwrap()[0].1.clone();
        assert_eq!(copy_blocks, base_blocks);
    }

    #[tokio::test]
    async fn unknown_snapshot_is_corruption() {
        let db = Database::new(":memory:").await.unwrap();
        assert!(
            db.state()
                .blocks_of(&[crate::types::SnapshotNid(42)])
                .await
                .is_err()
        );
    }
}
