//! SQLite persistent store.
//!
//! One database holds every durable collection: nodes, trees, folders,
//! context boxes, user-profile and folder docs, memory items and their
//! embeddings. Each collection has the secondary indexes its query patterns
//! need (children by parent, trees by folder, memories by scope and tag).
//!
//! Every logical operation that touches more than one record (subtree
//! delete, batch create, tree creation with its context box, folder delete)
//! runs inside one transaction. A failing statement drops the transaction
//! uncommitted, so no partial state is ever visible. Transactions take the
//! write lock up front (`BEGIN IMMEDIATE`), so concurrent read-modify-write
//! cycles on one record queue behind each other instead of failing when a
//! read lock is upgraded.
//!
//! Schema upgrades are additive and versioned; see [`migrations`].

mod boxes;
mod codec;
mod docs;
mod folders;
mod memories;
pub mod migrations;
mod nodes;
mod trees;

pub use memories::{MemoryFilter, StoredEmbedding};

use canopy_core::error::StoreError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub type Result<T> = std::result::Result<T, StoreError>;

/// How long a writer waits for the database lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// The SQLite-backed store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (tests). In-memory
    /// databases are private to one connection, so the pool is pinned to a
    /// single long-lived connection in that case.
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Open(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .pragma("foreign_keys", "ON");

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        migrations::run(&store.pool).await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    /// Wrap an existing pool and bring its schema up to date.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> Result<i64> {
        migrations::current_version(&self.pool).await
    }

    pub(crate) async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| StoreError::Transaction(format!("BEGIN failed: {e}")))
    }
}

pub(crate) async fn commit(tx: sqlx::Transaction<'static, sqlx::Sqlite>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| StoreError::Transaction(format!("COMMIT failed: {e}")))
}

/// Map a sqlx error to a query failure with context.
pub(crate) fn query_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Query(format!("{context}: {e}"))
}

/// Map a sqlx error raised inside a transaction.
pub(crate) fn tx_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Transaction(format!("{context}: {e}"))
}

#[cfg(test)]
pub(crate) async fn test_store() -> SqliteStore {
    SqliteStore::new("sqlite::memory:").await.unwrap()
}
