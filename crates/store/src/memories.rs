//! The `memory_items`, `memory_item_tags` and `memory_embeddings` collections.

use crate::codec::{blob_to_vector, from_json, get, get_ts, to_json, ts, vector_to_blob};
use crate::{Result, SqliteStore, commit, query_err, tx_err};
use canopy_core::error::StoreError;
use canopy_core::memory::{Confidence, MemoryItem, MemoryScope, MemorySource, MemoryStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;
use tracing::debug;

const COLLECTION: &str = "memory_items";

const SELECT_ITEMS: &str = r#"
    SELECT m.*,
           (SELECT json_group_array(t.tag) FROM memory_item_tags t WHERE t.item_id = m.id) AS tags_json
    FROM memory_items m"#;

/// Candidate filter for memory listing. Empty/unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Any of these scopes
    pub scopes: Vec<MemoryScope>,
    pub status: Option<MemoryStatus>,
    /// Items must carry every one of these tags
    pub tags: Vec<String>,
    /// Inclusive `updated_at` bounds
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
}

/// A persisted embedding and the hash of the text it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub text_hash: String,
    pub vector: Vec<f32>,
}

fn row_to_item(row: &SqliteRow) -> Result<MemoryItem> {
    let kind: String = get(row, COLLECTION, "scope")?;
    let folder_id: Option<String> = get(row, COLLECTION, "folder_id")?;
    let scope = MemoryScope::from_parts(&kind, folder_id).ok_or_else(|| StoreError::Corrupt {
        collection: COLLECTION,
        reason: format!("invalid scope '{kind}'"),
    })?;
    let raw_confidence: String = get(row, COLLECTION, "confidence")?;
    let raw_status: String = get(row, COLLECTION, "status")?;
    let sources_json: String = get(row, COLLECTION, "sources")?;
    let tags_json: Option<String> = get(row, COLLECTION, "tags_json")?;
    let mut tags: Vec<String> = match tags_json {
        Some(raw) => from_json(COLLECTION, &raw)?,
        None => Vec::new(),
    };
    tags.sort();

    Ok(MemoryItem {
        id: get(row, COLLECTION, "id")?,
        scope,
        text: get(row, COLLECTION, "text")?,
        tags,
        confidence: Confidence::parse(&raw_confidence).unwrap_or_default(),
        status: MemoryStatus::parse(&raw_status).ok_or_else(|| StoreError::Corrupt {
            collection: COLLECTION,
            reason: format!("invalid status '{raw_status}'"),
        })?,
        created_at: get_ts(row, COLLECTION, "created_at")?,
        updated_at: get_ts(row, COLLECTION, "updated_at")?,
        sources: from_json::<Vec<MemorySource>>(COLLECTION, &sources_json)?,
    })
}

impl SqliteStore {
    /// Insert or replace an item and its tag rows in one transaction.
    /// `created_at` of an existing item is kept.
    pub async fn upsert_memory(&self, item: &MemoryItem) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO memory_items (id, scope, folder_id, text, confidence, status, sources, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                scope = excluded.scope,
                folder_id = excluded.folder_id,
                text = excluded.text,
                confidence = excluded.confidence,
                status = excluded.status,
                sources = excluded.sources,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.id)
        .bind(item.scope.kind())
        .bind(item.scope.folder_id())
        .bind(&item.text)
        .bind(item.confidence.as_str())
        .bind(item.status.as_str())
        .bind(to_json(COLLECTION, &item.sources)?)
        .bind(ts(&item.created_at))
        .bind(ts(&item.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(tx_err("UPSERT memory item"))?;

        sqlx::query("DELETE FROM memory_item_tags WHERE item_id = ?1")
            .bind(&item.id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE memory tags"))?;
        for tag in &item.tags {
            sqlx::query("INSERT OR IGNORE INTO memory_item_tags (item_id, tag) VALUES (?1, ?2)")
                .bind(&item.id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(tx_err("INSERT memory tag"))?;
        }
        commit(tx).await?;
        debug!(memory_id = %item.id, tags = item.tags.len(), "Stored memory item");
        Ok(())
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<MemoryItem>> {
        let sql = format!("{SELECT_ITEMS} WHERE m.id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT memory item"))?;
        row.as_ref().map(row_to_item).transpose()
    }

    /// Fetch items by id. Unknown ids are skipped; order is unspecified.
    pub async fn get_memories(&self, ids: &[String]) -> Result<Vec<MemoryItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("{SELECT_ITEMS} WHERE m.id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT memory items by id"))?;
        rows.iter().map(row_to_item).collect()
    }

    /// Items matching `filter`, most recently updated first.
    pub async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<MemoryItem>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if !filter.scopes.is_empty() {
            let mut alternatives = Vec::new();
            for scope in &filter.scopes {
                match scope {
                    MemoryScope::User => alternatives.push("m.scope = 'user'".to_string()),
                    MemoryScope::Folder { folder_id } => {
                        alternatives.push("(m.scope = 'folder' AND m.folder_id = ?)".to_string());
                        binds.push(folder_id.clone());
                    }
                }
            }
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        if let Some(status) = filter.status {
            clauses.push("m.status = ?".into());
            binds.push(status.as_str().into());
        }
        for tag in &filter.tags {
            clauses.push(
                "EXISTS (SELECT 1 FROM memory_item_tags t WHERE t.item_id = m.id AND t.tag = ?)".into(),
            );
            binds.push(tag.trim().to_lowercase());
        }
        if let Some(from) = &filter.updated_from {
            clauses.push("m.updated_at >= ?".into());
            binds.push(ts(from));
        }
        if let Some(to) = &filter.updated_to {
            clauses.push("m.updated_at <= ?".into());
            binds.push(ts(to));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("{SELECT_ITEMS}{where_sql} ORDER BY m.updated_at DESC, m.id");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT memory items"))?;
        rows.iter().map(row_to_item).collect()
    }

    /// Change an item's status. Returns `false` if it does not exist.
    pub async fn set_memory_status(&self, id: &str, status: MemoryStatus, updated_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE memory_items SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(ts(&updated_at))
            .execute(&self.pool)
            .await
            .map_err(query_err("UPDATE memory status"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete an item with its tags and embeddings.
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        for sql in [
            "DELETE FROM memory_item_tags WHERE item_id = ?1",
            "DELETE FROM memory_embeddings WHERE item_id = ?1",
        ] {
            sqlx::query(sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(tx_err("DELETE memory dependents"))?;
        }
        let result = sqlx::query("DELETE FROM memory_items WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE memory item"))?;
        commit(tx).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn put_embedding(&self, item_id: &str, model_key: &str, embedding: &StoredEmbedding) -> Result<()> {
        sqlx::query(
            "INSERT INTO memory_embeddings (item_id, model_key, text_hash, vector) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id, model_key) DO UPDATE SET text_hash = excluded.text_hash, vector = excluded.vector",
        )
        .bind(item_id)
        .bind(model_key)
        .bind(&embedding.text_hash)
        .bind(vector_to_blob(&embedding.vector))
        .execute(&self.pool)
        .await
        .map_err(query_err("UPSERT embedding"))?;
        Ok(())
    }

    /// Stored embeddings under `model_key` for the given items.
    pub async fn embeddings_for(&self, model_key: &str, item_ids: &[String]) -> Result<HashMap<String, StoredEmbedding>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let sql = format!(
            "SELECT item_id, text_hash, vector FROM memory_embeddings WHERE model_key = ? AND item_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(model_key);
        for id in item_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT embeddings"))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let item_id: String = get(row, "memory_embeddings", "item_id")?;
            let blob: Vec<u8> = get(row, "memory_embeddings", "vector")?;
            out.insert(
                item_id,
                StoredEmbedding {
                    text_hash: get(row, "memory_embeddings", "text_hash")?,
                    vector: blob_to_vector(&blob),
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use chrono::Duration;

    fn item_at(scope: MemoryScope, text: &str, minutes_ago: i64) -> MemoryItem {
        let mut item = MemoryItem::new(scope, text);
        item.updated_at = Utc::now() - Duration::minutes(minutes_ago);
        item.created_at = item.updated_at;
        item
    }

    #[tokio::test]
    async fn upsert_roundtrip_with_tags() {
        let store = test_store().await;
        let item = MemoryItem::new(MemoryScope::Folder { folder_id: "f1".into() }, "Uses PostgreSQL")
            .with_tags(["db", "stack"])
            .with_source(MemorySource {
                tree_id: Some("t1".into()),
                node_ids: vec!["n1".into()],
                origin: Some("auto".into()),
            });
        store.upsert_memory(&item).await.unwrap();
        assert_eq!(store.get_memory(&item.id).await.unwrap().unwrap(), item);

        let mut changed = item.clone();
        changed.tags = vec!["db".into()];
        changed.text = "Uses SQLite".into();
        store.upsert_memory(&changed).await.unwrap();
        let loaded = store.get_memory(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["db"]);
        assert_eq!(loaded.text, "Uses SQLite");
    }

    #[tokio::test]
    async fn list_filters_scope_status_tags_and_time() {
        let store = test_store().await;
        let user = item_at(MemoryScope::User, "likes tea", 10).with_tags(["drink"]);
        let folder = item_at(MemoryScope::Folder { folder_id: "f1".into() }, "deadline friday", 5);
        let other = item_at(MemoryScope::Folder { folder_id: "f2".into() }, "other", 1);
        let mut archived = item_at(MemoryScope::User, "old", 2);
        archived.status = MemoryStatus::Archived;
        for i in [&user, &folder, &other, &archived] {
            store.upsert_memory(i).await.unwrap();
        }

        let filter = MemoryFilter {
            scopes: vec![MemoryScope::User, MemoryScope::Folder { folder_id: "f1".into() }],
            status: Some(MemoryStatus::Active),
            ..Default::default()
        };
        let ids: Vec<_> = store.list_memories(&filter).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![folder.id.clone(), user.id.clone()]);

        let tagged = MemoryFilter {
            tags: vec!["DRINK".into()],
            ..Default::default()
        };
        assert_eq!(store.list_memories(&tagged).await.unwrap().len(), 1);

        let window = MemoryFilter {
            updated_from: Some(Utc::now() - Duration::minutes(6)),
            updated_to: Some(Utc::now() - Duration::minutes(3)),
            ..Default::default()
        };
        let ids: Vec<_> = store.list_memories(&window).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![folder.id]);
    }

    #[tokio::test]
    async fn embeddings_are_keyed_by_model() {
        let store = test_store().await;
        let item = MemoryItem::new(MemoryScope::User, "x");
        store.upsert_memory(&item).await.unwrap();
        let emb = StoredEmbedding {
            text_hash: "abc".into(),
            vector: vec![1.0, 0.0],
        };
        store.put_embedding(&item.id, "model-a", &emb).await.unwrap();

        let ids = vec![item.id.clone()];
        assert_eq!(store.embeddings_for("model-a", &ids).await.unwrap()[&item.id], emb);
        assert!(store.embeddings_for("model-b", &ids).await.unwrap().is_empty());

        assert!(store.delete_memory(&item.id).await.unwrap());
        assert!(store.embeddings_for("model-a", &ids).await.unwrap().is_empty());
        assert!(!store.delete_memory(&item.id).await.unwrap());
    }

    #[tokio::test]
    async fn status_change() {
        let store = test_store().await;
        let item = MemoryItem::new(MemoryScope::User, "x");
        store.upsert_memory(&item).await.unwrap();
        assert!(store.set_memory_status(&item.id, MemoryStatus::Archived, Utc::now()).await.unwrap());
        assert_eq!(
            store.get_memory(&item.id).await.unwrap().unwrap().status,
            MemoryStatus::Archived
        );
    }
}
