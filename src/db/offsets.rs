//! Ingress partition-offset checkpoints.

use sqlx::SqlitePool;

use super::DbError;

/// Repository for per-partition consumer offsets.
pub struct OffsetRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OffsetRepository<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// The next offset to consume for a topic partition. Zero if the
    /// partition has never been consumed.
    pub async fn next_offset(&self, topic: &str, partition: u32) -> Result<i64, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT next_offset FROM partition_offsets WHERE topic = ? AND partition = ?",
        )
        .bind(topic)
        .bind(partition as i64)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(|(offset,)| offset).unwrap_or(0))
    }

    /// Checkpoint the next offset to consume for a topic partition.
    pub async fn set_next_offset(
        &self,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO partition_offsets (topic, partition, next_offset) VALUES (?, ?, ?)
             ON CONFLICT (topic, partition) DO UPDATE SET next_offset = excluded.next_offset",
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(next_offset)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}
