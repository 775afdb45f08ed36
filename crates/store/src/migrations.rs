//! Versioned, additive schema migrations.
//!
//! `schema_meta` holds the current version. Each migration is a list of
//! statements applied in one transaction together with the version bump.
//! Migrations only ever add tables, columns and indexes; existing data is
//! never dropped or rewritten.

use crate::{Result, tx_err};
use canopy_core::error::StoreError;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversation graph",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS nodes (
                id          TEXT PRIMARY KEY NOT NULL,
                parent_id   TEXT,
                node_type   TEXT NOT NULL,
                content     TEXT NOT NULL,
                summary     TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                metadata    TEXT NOT NULL DEFAULT '{}',
                pos_x       REAL,
                pos_y       REAL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id, created_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(node_type)",
            "CREATE INDEX IF NOT EXISTS idx_nodes_created_at ON nodes(created_at)",
            r#"CREATE TABLE IF NOT EXISTS folders (
                id             TEXT PRIMARY KEY NOT NULL,
                name           TEXT NOT NULL,
                system_prompt  TEXT NOT NULL,
                memory         TEXT NOT NULL DEFAULT '{}',
                enabled_models TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS trees (
                id         TEXT PRIMARY KEY NOT NULL,
                root_id    TEXT NOT NULL,
                title      TEXT NOT NULL,
                folder_id  TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_trees_folder ON trees(folder_id)",
            "CREATE INDEX IF NOT EXISTS idx_trees_updated_at ON trees(updated_at)",
            r#"CREATE TABLE IF NOT EXISTS context_boxes (
                id   TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL
            )"#,
        ],
    },
    Migration {
        version: 2,
        name: "long-term docs",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS user_profile_docs (
                id   TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS folder_docs (
                folder_id TEXT PRIMARY KEY NOT NULL,
                body      TEXT NOT NULL
            )"#,
        ],
    },
    Migration {
        version: 3,
        name: "memory items",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS memory_items (
                id         TEXT PRIMARY KEY NOT NULL,
                scope      TEXT NOT NULL,
                folder_id  TEXT,
                text       TEXT NOT NULL,
                confidence TEXT NOT NULL,
                status     TEXT NOT NULL,
                sources    TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_memory_scope ON memory_items(scope, folder_id)",
            "CREATE INDEX IF NOT EXISTS idx_memory_status ON memory_items(status)",
            "CREATE INDEX IF NOT EXISTS idx_memory_updated_at ON memory_items(updated_at)",
            r#"CREATE TABLE IF NOT EXISTS memory_item_tags (
                item_id TEXT NOT NULL REFERENCES memory_items(id) ON DELETE CASCADE,
                tag     TEXT NOT NULL,
                PRIMARY KEY (item_id, tag)
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_item_tags(tag)",
        ],
    },
    Migration {
        version: 4,
        name: "memory embeddings",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS memory_embeddings (
                item_id   TEXT NOT NULL REFERENCES memory_items(id) ON DELETE CASCADE,
                model_key TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                vector    BLOB NOT NULL,
                PRIMARY KEY (item_id, model_key)
            )"#,
        ],
    },
];

pub const LATEST_VERSION: i64 = 4;

pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_meta")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::Query(format!("schema version: {e}")))?;
    row.try_get("version")
        .map_err(|e| StoreError::Query(format!("version column: {e}")))
}

/// Apply every migration newer than the stored version.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| StoreError::Migration {
            version: 0,
            reason: format!("schema_meta: {e}"),
        })?;

    let current = current_version(pool).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(pool, migration).await?;
        info!(
            version = migration.version,
            name = migration.name,
            "Applied schema migration"
        );
    }
    debug!("SQLite migrations complete");
    Ok(())
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let fail = |e: sqlx::Error| StoreError::Migration {
        version: migration.version,
        reason: e.to_string(),
    };
    let mut tx = pool.begin().await.map_err(fail)?;
    for statement in migration.statements {
        sqlx::query(*statement).execute(&mut *tx).await.map_err(fail)?;
    }
    sqlx::query("INSERT INTO schema_meta (version) VALUES (?1)")
        .bind(migration.version)
        .execute(&mut *tx)
        .await
        .map_err(fail)?;
    tx.commit().await.map_err(tx_err("migration commit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(LATEST_VERSION));
    }

    #[test]
    fn migrations_are_additive() {
        for m in MIGRATIONS {
            for s in m.statements {
                let upper = s.to_uppercase();
                assert!(!upper.contains("DROP "), "v{} drops: {s}", m.version);
                assert!(!upper.contains("DELETE FROM"), "v{} deletes: {s}", m.version);
            }
        }
    }

    #[tokio::test]
    async fn partial_schema_is_upgraded() {
        let store = crate::test_store().await;
        // Simulate a database created at v2
        sqlx::query("DELETE FROM schema_meta WHERE version > 2")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("DROP TABLE memory_embeddings")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(current_version(store.pool()).await.unwrap(), 2);

        run(store.pool()).await.unwrap();
        assert_eq!(current_version(store.pool()).await.unwrap(), LATEST_VERSION);
        sqlx::query("SELECT COUNT(*) FROM memory_embeddings")
            .fetch_one(store.pool())
            .await
            .unwrap();
    }
}
