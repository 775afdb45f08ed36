//! The `nodes` collection.

use crate::codec::{from_json, get, get_ts, to_json, ts};
use crate::{Result, SqliteStore, boxes, commit, query_err, tx_err};
use canopy_core::error::StoreError;
use canopy_core::node::{Node, NodeMetadata, NodeType, Position};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};
use tracing::debug;

const COLLECTION: &str = "nodes";

const SUBTREE_CTE: &str = r#"
    WITH RECURSIVE sub(id) AS (
        SELECT id FROM nodes WHERE id = ?1
        UNION
        SELECT n.id FROM nodes n JOIN sub ON n.parent_id = sub.id
    )"#;

fn row_to_node(row: &SqliteRow) -> Result<Node> {
    let raw_type: String = get(row, COLLECTION, "node_type")?;
    let node_type = NodeType::parse(&raw_type).ok_or_else(|| StoreError::Corrupt {
        collection: COLLECTION,
        reason: format!("unknown node type '{raw_type}'"),
    })?;
    let metadata_json: String = get(row, COLLECTION, "metadata")?;
    let metadata: NodeMetadata = from_json(COLLECTION, &metadata_json)?;
    let token_count: i64 = get(row, COLLECTION, "token_count")?;
    let pos_x: Option<f64> = get(row, COLLECTION, "pos_x")?;
    let pos_y: Option<f64> = get(row, COLLECTION, "pos_y")?;

    Ok(Node {
        id: get(row, COLLECTION, "id")?,
        node_type,
        parent_id: get(row, COLLECTION, "parent_id")?,
        content: get(row, COLLECTION, "content")?,
        summary: get(row, COLLECTION, "summary")?,
        created_at: get_ts(row, COLLECTION, "created_at")?,
        updated_at: get_ts(row, COLLECTION, "updated_at")?,
        token_count: token_count.max(0) as usize,
        metadata,
        position: pos_x.zip(pos_y).map(|(x, y)| Position { x, y }),
    })
}

pub(crate) async fn insert<'e, E>(exec: E, node: &Node) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO nodes (id, parent_id, node_type, content, summary, created_at, updated_at,
                           token_count, metadata, pos_x, pos_y)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&node.id)
    .bind(&node.parent_id)
    .bind(node.node_type.as_str())
    .bind(&node.content)
    .bind(&node.summary)
    .bind(ts(&node.created_at))
    .bind(ts(&node.updated_at))
    .bind(node.token_count as i64)
    .bind(to_json(COLLECTION, &node.metadata)?)
    .bind(node.position.map(|p| p.x))
    .bind(node.position.map(|p| p.y))
    .execute(exec)
    .await
    .map_err(query_err("INSERT node"))?;
    Ok(())
}

pub(crate) async fn fetch_many<'e, E>(exec: E, ids: &[String]) -> Result<Vec<Node>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT * FROM nodes WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(exec).await.map_err(query_err("SELECT nodes by id"))?;
    rows.iter().map(row_to_node).collect()
}

impl SqliteStore {
    pub async fn insert_node(&self, node: &Node) -> Result<()> {
        insert(&self.pool, node).await?;
        debug!(node_id = %node.id, node_type = node.node_type.as_str(), "Stored node");
        Ok(())
    }

    /// Insert several nodes as one unit: all or none.
    pub async fn insert_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut tx = self.begin().await?;
        for node in nodes {
            insert(&mut *tx, node)
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
        }
        commit(tx).await?;
        debug!(count = nodes.len(), "Stored node batch");
        Ok(())
    }

    /// Like [`insert_nodes`](Self::insert_nodes), but every named parent must
    /// already be stored or come earlier in the batch. The check runs inside
    /// the write transaction.
    pub async fn insert_attached_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut tx = self.begin().await?;
        for (i, node) in nodes.iter().enumerate() {
            if let Some(parent_id) = &node.parent_id {
                let in_batch = nodes[..i].iter().any(|n| &n.id == parent_id);
                if !in_batch {
                    let stored = sqlx::query("SELECT 1 FROM nodes WHERE id = ?1")
                        .bind(parent_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(tx_err("SELECT parent"))?;
                    if stored.is_none() {
                        return Err(StoreError::MissingParent(parent_id.clone()));
                    }
                }
            }
            insert(&mut *tx, node)
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
        }
        commit(tx).await?;
        debug!(count = nodes.len(), "Stored attached node batch");
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT node"))?;
        row.as_ref().map(row_to_node).transpose()
    }

    /// Fetch nodes by id. Unknown ids are skipped; order is unspecified.
    pub async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        fetch_many(&self.pool, ids).await
    }

    /// Children of `parent_id`, oldest first (ties by id).
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE parent_id = ?1 ORDER BY created_at, id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT children"))?;
        rows.iter().map(row_to_node).collect()
    }

    /// Every node reachable from `root_id`, including it, oldest first.
    pub async fn subtree(&self, root_id: &str) -> Result<Vec<Node>> {
        let sql = format!(
            "{SUBTREE_CTE} SELECT nodes.* FROM nodes JOIN sub ON nodes.id = sub.id ORDER BY nodes.created_at, nodes.id"
        );
        let rows = sqlx::query(&sql)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT subtree"))?;
        rows.iter().map(row_to_node).collect()
    }

    /// `node_id` and every ancestor reachable through parent links. Stops at
    /// dangling parents; repeated ids end the walk.
    pub async fn ancestors(&self, node_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE chain(id, parent_id) AS (
                SELECT id, parent_id FROM nodes WHERE id = ?1
                UNION
                SELECT n.id, n.parent_id FROM nodes n JOIN chain c ON n.id = c.parent_id
            )
            SELECT nodes.* FROM nodes JOIN chain ON nodes.id = chain.id
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("SELECT ancestors"))?;
        rows.iter().map(row_to_node).collect()
    }

    /// Overwrite a node's mutable fields. Returns `false` if it does not exist.
    pub async fn update_node(&self, node: &Node) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET content = ?2, summary = ?3, updated_at = ?4, token_count = ?5,
                             metadata = ?6, pos_x = ?7, pos_y = ?8
            WHERE id = ?1
            "#,
        )
        .bind(&node.id)
        .bind(&node.content)
        .bind(&node.summary)
        .bind(ts(&node.updated_at))
        .bind(node.token_count as i64)
        .bind(to_json(COLLECTION, &node.metadata)?)
        .bind(node.position.map(|p| p.x))
        .bind(node.position.map(|p| p.y))
        .execute(&self.pool)
        .await
        .map_err(query_err("UPDATE node"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete `node_id` and its whole subtree in one transaction. When
    /// `tree_id` is given, blocks referencing deleted nodes are dropped from
    /// that tree's context box in the same transaction. Returns the deleted ids.
    pub async fn delete_subtree(&self, node_id: &str, tree_id: Option<&str>) -> Result<Vec<String>> {
        let mut tx = self.begin().await?;
        let ids = subtree_ids(&mut tx, node_id).await?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let sql = format!("{SUBTREE_CTE} DELETE FROM nodes WHERE id IN (SELECT id FROM sub)");
        sqlx::query(&sql)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE subtree"))?;

        if let Some(tree_id) = tree_id {
            if let Some((mut context_box, migrated)) = boxes::load_raw(&mut tx, tree_id).await? {
                if context_box.remove_nodes(&ids) > 0 || migrated {
                    boxes::write(&mut *tx, &context_box).await?;
                }
            }
        }

        commit(tx).await?;
        debug!(node_id, deleted = ids.len(), "Deleted subtree");
        Ok(ids)
    }

    /// Case-insensitive substring match over content and tags, oldest first.
    pub async fn search_nodes(&self, query: &str) -> Result<Vec<Node>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT nodes for search"))?;
        let mut matches = Vec::new();
        for row in &rows {
            let node = row_to_node(row)?;
            let hit = node.content.to_lowercase().contains(&needle)
                || node
                    .metadata
                    .tags
                    .iter()
                    .any(|t| t.to_lowercase().contains(&needle));
            if hit {
                matches.push(node);
            }
        }
        Ok(matches)
    }
}

pub(crate) async fn subtree_ids(
    tx: &mut sqlx::Transaction<'static, Sqlite>,
    root_id: &str,
) -> Result<Vec<String>> {
    let sql = format!("{SUBTREE_CTE} SELECT id FROM sub");
    let ids: Vec<(String,)> = sqlx::query_as(&sql)
        .bind(root_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(tx_err("SELECT subtree ids"))?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use chrono::{Duration, Utc};

    fn child(parent: &Node, content: &str, offset_ms: i64) -> Node {
        let mut n = Node::new(NodeType::User, Some(parent.id.clone()), content);
        n.created_at = parent.created_at + Duration::milliseconds(offset_ms);
        n.updated_at = n.created_at;
        n
    }

    #[tokio::test]
    async fn node_roundtrip_preserves_fields() {
        let store = test_store().await;
        let mut node = Node::new(NodeType::Assistant, None, "hello");
        node.metadata.tags = vec!["greeting".into()];
        node.position = Some(Position { x: 10.0, y: 20.0 });
        store.insert_node(&node).await.unwrap();

        let loaded = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded, node);
        assert!(store.get_node("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn children_are_ordered_by_creation() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let late = child(&root, "late", 20);
        let early = child(&root, "early", 10);
        store.insert_nodes(&[root.clone(), late.clone(), early.clone()]).await.unwrap();

        let kids = store.children(&root.id).await.unwrap();
        let contents: Vec<_> = kids.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let store = test_store().await;
        let a = Node::new(NodeType::System, None, "a");
        // duplicate id makes the second insert fail
        let dup = a.clone();
        assert!(store.insert_nodes(&[a.clone(), dup]).await.is_err());
        assert!(store.get_node(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_subtree_leaves_siblings() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let a = child(&root, "a", 1);
        let a1 = child(&a, "a1", 2);
        let a2 = child(&a1, "a2", 3);
        let b = child(&root, "b", 4);
        store
            .insert_nodes(&[root.clone(), a.clone(), a1.clone(), a2.clone(), b.clone()])
            .await
            .unwrap();

        let mut deleted = store.delete_subtree(&a.id, None).await.unwrap();
        deleted.sort();
        let mut expected = vec![a.id.clone(), a1.id.clone(), a2.id.clone()];
        expected.sort();
        assert_eq!(deleted, expected);

        let remaining = store.subtree(&root.id).await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![root.id.clone(), b.id.clone()]);
    }

    #[tokio::test]
    async fn ancestors_walk_to_root() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let a = child(&root, "a", 1);
        let b = child(&a, "b", 2);
        let other = child(&root, "other", 3);
        store
            .insert_nodes(&[root.clone(), a.clone(), b.clone(), other])
            .await
            .unwrap();

        let mut ids: Vec<_> = store.ancestors(&b.id).await.unwrap().into_iter().map(|n| n.id).collect();
        ids.sort();
        let mut expected = vec![root.id, a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn attached_batch_with_unknown_parent_stores_nothing() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let a = child(&root, "a", 1);
        let orphan = Node::new(NodeType::User, Some("ghost".into()), "orphan");
        let err = store
            .insert_attached_nodes(&[root.clone(), a.clone(), orphan])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent(id) if id == "ghost"));
        assert!(store.get_node(&root.id).await.unwrap().is_none());

        store.insert_attached_nodes(&[root.clone(), a.clone()]).await.unwrap();
        let b = child(&a, "b", 2);
        store.insert_attached_nodes(&[b.clone()]).await.unwrap();
        assert_eq!(store.get_node(&b.id).await.unwrap().unwrap().parent_id, Some(a.id));
    }

    #[tokio::test]
    async fn ancestors_terminate_on_cycle() {
        let store = test_store().await;
        let mut x = Node::new(NodeType::User, Some("y".into()), "x");
        x.id = "x".into();
        let mut y = Node::new(NodeType::User, Some("x".into()), "y");
        y.id = "y".into();
        store.insert_nodes(&[x, y]).await.unwrap();
        assert_eq!(store.ancestors("x").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_matches_content_and_tags_case_insensitively() {
        let store = test_store().await;
        let root = Node::new(NodeType::System, None, "root");
        let a = child(&root, "Tell me about RUST lifetimes", 1);
        let mut b = child(&root, "unrelated", 2);
        b.metadata.tags = vec!["Rustacean".into()];
        let c = child(&root, "python", 3);
        store.insert_nodes(&[root, a.clone(), b.clone(), c]).await.unwrap();

        let hits: Vec<_> = store.search_nodes("rust").await.unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(hits, vec![a.id, b.id]);
        assert!(store.search_nodes("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_node_overwrites_content() {
        let store = test_store().await;
        let mut node = Node::new(NodeType::User, None, "old");
        store.insert_node(&node).await.unwrap();
        node.content = "new content".into();
        node.updated_at = Utc::now();
        assert!(store.update_node(&node).await.unwrap());
        assert_eq!(store.get_node(&node.id).await.unwrap().unwrap().content, "new content");

        let ghost = Node::new(NodeType::User, None, "ghost");
        assert!(!store.update_node(&ghost).await.unwrap());
    }
}
