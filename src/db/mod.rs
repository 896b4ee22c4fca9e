//! Persistent store, organized as repositories over one SQLite pool:
//! identifier interning (rooms, event types, state keys), event bodies
//! and their graph metadata, delta-encoded state snapshots, and ingress
//! partition offsets.

mod events;
mod interner;
mod offsets;
mod rooms;
mod state;

pub use events::{AddedEvent, EventRepository, StoredEvent};
pub use interner::InternRepository;
pub use offsets::OffsetRepository;
pub use rooms::RoomRepository;
pub use state::StateRepository;

use dashmap::DashMap;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Pool size shared by the write pipeline and the query readers.
const POOL_CONNECTIONS: u32 = 8;

/// How long an acquire may wait on a busy pool before failing.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Named locks serializing the store's two allocation races: NID
/// allocation per interning namespace, and room creation per room ID.
#[derive(Default)]
pub(crate) struct StoreLocks {
    pub(crate) event_types: Mutex<()>,
    pub(crate) state_keys: Mutex<()>,
    pub(crate) rooms: DashMap<String, Arc<Mutex<()>>>,
}

/// Shared store handle: the SQLite pool plus the named allocation locks.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    locks: Arc<StoreLocks>,
}

impl Database {
    /// Open the store at `path` and apply the embedded schema.
    ///
    /// `:memory:` selects a shared-cache in-memory database, so every
    /// pooled connection sees one set of tables; anything else is a file
    /// path whose parent directory is created on demand.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
        } else {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty())
                && let Err(e) = std::fs::create_dir_all(dir)
            {
                tracing::warn!(dir = %dir.display(), error = %e, "Could not create store directory");
            }
            SqliteConnectOptions::new().filename(path)
        };
        let options = options.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_CONNECTIONS)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        info!(path, "Store opened");

        Ok(Self {
            pool,
            locks: Arc::new(StoreLocks::default()),
        })
    }

    /// The underlying pool, for tests that inspect tables directly.
    #[allow(dead_code)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run the embedded schema migration.
    ///
    /// Every statement is idempotent (`IF NOT EXISTS` / `OR IGNORE`), so
    /// the file runs unconditionally on open.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        let migration = include_str!("../../migrations/001_init.sql");
        for statement in migration.split(';') {
            let sql: Vec<&str> = statement
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("--"))
                .collect();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(&sql.join("\n")).execute(pool).await?;
        }
        info!("Database migrations applied (001_init)");
        Ok(())
    }

    /// Get the interning repository.
    pub fn interner(&self) -> InternRepository<'_> {
        InternRepository::new(&self.pool, &self.locks)
    }

    /// Get the room repository.
    pub fn rooms(&self) -> RoomRepository<'_> {
        RoomRepository::new(&self.pool, &self.locks)
    }

    /// Get the event repository.
    pub fn events(&self) -> EventRepository<'_> {
        EventRepository::new(&self.pool)
    }

    /// Get the state-snapshot repository.
    pub fn state(&self) -> StateRepository<'_> {
        StateRepository::new(&self.pool)
    }

    /// Get the partition-offset repository.
    pub fn offsets(&self) -> OffsetRepository<'_> {
        OffsetRepository::new(&self.pool)
    }
}

/// Build a `?, ?, ...` placeholder list for dynamic `IN` clauses.
pub(crate) fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}
