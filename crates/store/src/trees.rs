//! The `trees` collection.

use crate::codec::{get, get_ts, ts};
use crate::{Result, SqliteStore, boxes, commit, nodes, query_err, tx_err};
use canopy_core::context_box::ContextBox;
use canopy_core::error::StoreError;
use canopy_core::node::Node;
use canopy_core::tree::ConversationTree;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Sqlite};
use tracing::debug;

const COLLECTION: &str = "trees";

fn row_to_tree(row: &SqliteRow) -> Result<ConversationTree> {
    Ok(ConversationTree {
        id: get(row, COLLECTION, "id")?,
        root_id: get(row, COLLECTION, "root_id")?,
        title: get(row, COLLECTION, "title")?,
        folder_id: get(row, COLLECTION, "folder_id")?,
        created_at: get_ts(row, COLLECTION, "created_at")?,
        updated_at: get_ts(row, COLLECTION, "updated_at")?,
    })
}

async fn insert<'e, E>(exec: E, tree: &ConversationTree) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO trees (id, root_id, title, folder_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&tree.id)
    .bind(&tree.root_id)
    .bind(&tree.title)
    .bind(&tree.folder_id)
    .bind(ts(&tree.created_at))
    .bind(ts(&tree.updated_at))
    .execute(exec)
    .await
    .map_err(query_err("INSERT tree"))?;
    Ok(())
}

impl SqliteStore {
    /// Persist a new tree together with its root node and initial box.
    pub async fn create_tree(&self, tree: &ConversationTree, root: &Node, context_box: &ContextBox) -> Result<()> {
        let mut tx = self.begin().await?;
        let wrap = |e: StoreError| StoreError::Transaction(format!("create tree {}: {e}", tree.id));
        nodes::insert(&mut *tx, root).await.map_err(wrap)?;
        insert(&mut *tx, tree).await.map_err(wrap)?;
        boxes::write(&mut *tx, context_box).await.map_err(wrap)?;
        commit(tx).await?;
        debug!(tree_id = %tree.id, root_id = %root.id, "Created tree");
        Ok(())
    }

    pub async fn get_tree(&self, id: &str) -> Result<Option<ConversationTree>> {
        let row = sqlx::query("SELECT * FROM trees WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT tree"))?;
        row.as_ref().map(row_to_tree).transpose()
    }

    /// Trees, most recently updated first. `folder_id` restricts to one folder.
    pub async fn list_trees(&self, folder_id: Option<&str>) -> Result<Vec<ConversationTree>> {
        let rows = match folder_id {
            Some(folder_id) => {
                sqlx::query("SELECT * FROM trees WHERE folder_id = ?1 ORDER BY updated_at DESC, id")
                    .bind(folder_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM trees ORDER BY updated_at DESC, id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(query_err("SELECT trees"))?;
        rows.iter().map(row_to_tree).collect()
    }

    /// Overwrite title, folder and `updated_at`. Returns `false` if missing.
    pub async fn update_tree(&self, tree: &ConversationTree) -> Result<bool> {
        let result = sqlx::query("UPDATE trees SET title = ?2, folder_id = ?3, updated_at = ?4 WHERE id = ?1")
            .bind(&tree.id)
            .bind(&tree.title)
            .bind(&tree.folder_id)
            .bind(ts(&tree.updated_at))
            .execute(&self.pool)
            .await
            .map_err(query_err("UPDATE tree"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a tree, its root's whole subtree and its context box in one
    /// transaction. Returns the deleted node ids, or `None` if the tree
    /// does not exist.
    pub async fn delete_tree(&self, id: &str) -> Result<Option<Vec<String>>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT * FROM trees WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(tx_err("SELECT tree"))?;
        let Some(tree) = row.as_ref().map(row_to_tree).transpose()? else {
            return Ok(None);
        };

        let node_ids = nodes::subtree_ids(&mut tx, &tree.root_id).await?;
        sqlx::query(
            r#"
            WITH RECURSIVE sub(id) AS (
                SELECT id FROM nodes WHERE id = ?1
                UNION
                SELECT n.id FROM nodes n JOIN sub ON n.parent_id = sub.id
            )
            DELETE FROM nodes WHERE id IN (SELECT id FROM sub)
            "#,
        )
        .bind(&tree.root_id)
        .execute(&mut *tx)
        .await
        .map_err(tx_err("DELETE tree nodes"))?;
        sqlx::query("DELETE FROM context_boxes WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE context box"))?;
        sqlx::query("DELETE FROM trees WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE tree"))?;
        commit(tx).await?;

        debug!(tree_id = id, nodes = node_ids.len(), "Deleted tree");
        Ok(Some(node_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use canopy_core::node::NodeType;

    async fn seeded_tree(store: &SqliteStore, title: &str, folder: Option<&str>) -> (ConversationTree, Node) {
        let root = Node::new(NodeType::System, None, "You are helpful.");
        let tree = ConversationTree::new(root.id.clone(), title, folder.map(String::from));
        let mut cb = ContextBox::new(tree.id.clone(), 8192);
        cb.add_node_block(&root);
        store.create_tree(&tree, &root, &cb).await.unwrap();
        (tree, root)
    }

    #[tokio::test]
    async fn create_tree_persists_all_three_records() {
        let store = test_store().await;
        let (tree, root) = seeded_tree(&store, "First", None).await;

        assert_eq!(store.get_tree(&tree.id).await.unwrap().unwrap(), tree);
        assert!(store.get_node(&root.id).await.unwrap().is_some());
        let cb = store.get_context_box(&tree.id).await.unwrap().unwrap();
        assert_eq!(cb.node_ids(), vec![root.id]);
    }

    #[tokio::test]
    async fn create_tree_is_atomic() {
        let store = test_store().await;
        let (tree, _) = seeded_tree(&store, "First", None).await;

        // Same tree id again: root insert succeeds, tree insert fails
        let root = Node::new(NodeType::System, None, "other");
        let mut dup = ConversationTree::new(root.id.clone(), "Dup", None);
        dup.id = tree.id.clone();
        let cb = ContextBox::new(dup.id.clone(), 10);
        assert!(matches!(
            store.create_tree(&dup, &root, &cb).await,
            Err(StoreError::Transaction(_))
        ));
        assert!(store.get_node(&root.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_tree_removes_subtree_and_box_only() {
        let store = test_store().await;
        let (tree, root) = seeded_tree(&store, "Doomed", None).await;
        let (other, other_root) = seeded_tree(&store, "Survivor", None).await;
        let kid = Node::new(NodeType::User, Some(root.id.clone()), "hi");
        store.insert_node(&kid).await.unwrap();

        let deleted = store.delete_tree(&tree.id).await.unwrap().unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(store.get_tree(&tree.id).await.unwrap().is_none());
        assert!(store.get_node(&kid.id).await.unwrap().is_none());
        assert!(store.get_context_box(&tree.id).await.unwrap().is_none());

        assert!(store.get_tree(&other.id).await.unwrap().is_some());
        assert!(store.get_node(&other_root.id).await.unwrap().is_some());
        assert!(store.delete_tree(&tree.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_trees_filters_by_folder() {
        let store = test_store().await;
        seeded_tree(&store, "loose", None).await;
        let (inside, _) = seeded_tree(&store, "inside", Some("f1")).await;

        assert_eq!(store.list_trees(None).await.unwrap().len(), 2);
        let in_folder = store.list_trees(Some("f1")).await.unwrap();
        assert_eq!(in_folder, vec![inside]);
    }
}
