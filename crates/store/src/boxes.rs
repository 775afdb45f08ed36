//! The `context_boxes` collection.
//!
//! Boxes are stored as JSON bodies keyed by tree id. Reading a box that is
//! still in a legacy shape upgrades it, refreshes its node token counts and
//! persists the upgraded form before returning it.

use crate::codec::{from_json, get, to_json};
use crate::{Result, SqliteStore, commit, nodes, query_err};
use canopy_core::context_box::ContextBox;
use canopy_core::error::StoreError;
use sqlx::{Executor, Sqlite, SqliteConnection};
use std::collections::HashMap;
use tracing::info;

const COLLECTION: &str = "context_boxes";

/// Load and decode a box. The flag is `true` when the stored body was in a
/// legacy shape and must be written back.
pub(crate) async fn load_raw(conn: &mut SqliteConnection, id: &str) -> Result<Option<(ContextBox, bool)>> {
    let row = sqlx::query("SELECT body FROM context_boxes WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err("SELECT context box"))?;
    let Some(row) = row else {
        return Ok(None);
    };
    let body: String = get(&row, COLLECTION, "body")?;
    let value: serde_json::Value = from_json(COLLECTION, &body)?;
    let (mut context_box, migrated) = ContextBox::decode(value).map_err(|e| StoreError::Corrupt {
        collection: COLLECTION,
        reason: format!("unrecognised box shape for {id}: {e}"),
    })?;

    if migrated {
        let referenced = nodes::fetch_many(&mut *conn, &context_box.node_ids()).await?;
        let by_id: HashMap<&str, &canopy_core::Node> =
            referenced.iter().map(|n| (n.id.as_str(), n)).collect();
        context_box.refresh_node_tokens(|id| by_id.get(id).copied());
    }
    Ok(Some((context_box, migrated)))
}

pub(crate) async fn write<'e, E>(exec: E, context_box: &ContextBox) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO context_boxes (id, body) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET body = excluded.body",
    )
    .bind(&context_box.id)
    .bind(to_json(COLLECTION, context_box)?)
    .execute(exec)
    .await
    .map_err(query_err("UPSERT context box"))?;
    Ok(())
}

impl SqliteStore {
    /// Read a box, migrating a legacy body in place on this read.
    pub async fn get_context_box(&self, id: &str) -> Result<Option<ContextBox>> {
        let mut tx = self.begin().await?;
        let Some((context_box, migrated)) = load_raw(&mut tx, id).await? else {
            return Ok(None);
        };
        if migrated {
            write(&mut *tx, &context_box).await?;
            commit(tx).await?;
            info!(box_id = id, blocks = context_box.blocks.len(), "Migrated legacy context box");
        }
        Ok(Some(context_box))
    }

    pub async fn put_context_box(&self, context_box: &ContextBox) -> Result<()> {
        write(&self.pool, context_box).await
    }

    /// Read-modify-write a box inside one transaction. Returns the updated
    /// box and the closure's result, or `None` if the box does not exist.
    pub async fn modify_context_box<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContextBox) -> R,
    ) -> Result<Option<(ContextBox, R)>> {
        let mut tx = self.begin().await?;
        let Some((mut context_box, _)) = load_raw(&mut tx, id).await? else {
            return Ok(None);
        };
        let out = f(&mut context_box);
        context_box.recompute_total();
        write(&mut *tx, &context_box).await?;
        commit(tx).await?;
        Ok(Some((context_box, out)))
    }

    /// Store a raw JSON body, bypassing decoding. Used to seed legacy data.
    pub async fn put_context_box_raw(&self, id: &str, body: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO context_boxes (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(id)
        .bind(body.to_string())
        .execute(&self.pool)
        .await
        .map_err(query_err("UPSERT raw context box"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use canopy_core::context_box::ContextBlock;
    use canopy_core::node::{Node, NodeType};

    #[tokio::test]
    async fn legacy_box_is_migrated_and_persisted() {
        let store = test_store().await;
        let a = Node::new(NodeType::System, None, "12345678");
        let b = Node::new(NodeType::User, Some(a.id.clone()), "1234");
        store.insert_nodes(&[a.clone(), b.clone()]).await.unwrap();
        store
            .put_context_box_raw("t1", &serde_json::json!({ "id": "t1", "nodeIds": [b.id.clone(), a.id.clone()] }))
            .await
            .unwrap();

        let cb = store.get_context_box("t1").await.unwrap().unwrap();
        assert_eq!(cb.node_ids(), vec![b.id.clone(), a.id.clone()]);
        assert!(cb.blocks.iter().all(|blk| matches!(blk, ContextBlock::Node(_))));
        assert_eq!(cb.total_tokens, 3);

        // The stored body is now canonical
        let row: (String,) = sqlx::query_as("SELECT body FROM context_boxes WHERE id = 't1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(row.0.contains("\"blocks\""));
        assert!(!row.0.contains("nodeIds"));

        // A second read returns the same block ids
        let again = store.get_context_box("t1").await.unwrap().unwrap();
        assert_eq!(again, cb);
    }

    #[tokio::test]
    async fn unknown_box_is_none_and_garbage_is_corrupt() {
        let store = test_store().await;
        assert!(store.get_context_box("nope").await.unwrap().is_none());
        store
            .put_context_box_raw("bad", &serde_json::json!({ "weird": true }))
            .await
            .unwrap();
        assert!(matches!(
            store.get_context_box("bad").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edits_of_one_box_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("boxes.db").display());
        let store = SqliteStore::new(&url).await.unwrap();
        let root = Node::new(NodeType::System, None, "root");
        let kids: Vec<Node> = (0..16)
            .map(|i| Node::new(NodeType::User, Some(root.id.clone()), format!("kid {i}")))
            .collect();
        store.insert_node(&root).await.unwrap();
        store.insert_nodes(&kids).await.unwrap();
        let mut cb = ContextBox::new("t", 1000);
        cb.add_node_block(&root);
        store.put_context_box(&cb).await.unwrap();

        let tasks: Vec<_> = kids
            .iter()
            .cloned()
            .map(|kid| {
                let store = store.clone();
                tokio::spawn(async move { store.modify_context_box("t", |cb| cb.add_node_block(&kid)).await })
            })
            .collect();
        for task in tasks {
            let (_, added) = task.await.unwrap().unwrap().unwrap();
            assert!(added);
        }

        let cb = store.get_context_box("t").await.unwrap().unwrap();
        assert_eq!(cb.blocks.len(), 17);
        let sum: usize = cb.blocks.iter().map(ContextBlock::token_count).sum();
        assert_eq!(cb.total_tokens, sum);
    }

    #[tokio::test]
    async fn delete_subtree_prunes_box() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let kid = Node::new(NodeType::User, Some(root.id.clone()), "kid");
        store.insert_nodes(&[root.clone(), kid.clone()]).await.unwrap();
        let mut cb = ContextBox::new("t1", 100);
        cb.add_node_block(&root);
        cb.add_node_block(&kid);
        store.put_context_box(&cb).await.unwrap();

        store.delete_subtree(&kid.id, Some("t1")).await.unwrap();
        let cb = store.get_context_box("t1").await.unwrap().unwrap();
        assert_eq!(cb.node_ids(), vec![root.id]);
    }
}
