//! The `folders` collection.

use crate::codec::{from_json, get, get_ts, to_json, ts};
use crate::{Result, SqliteStore, commit, query_err, tx_err};
use canopy_core::tree::{ConversationFolder, FolderMemorySettings};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

const COLLECTION: &str = "folders";

fn row_to_folder(row: &SqliteRow) -> Result<ConversationFolder> {
    let memory_json: String = get(row, COLLECTION, "memory")?;
    let memory: FolderMemorySettings = from_json(COLLECTION, &memory_json)?;
    let models_json: Option<String> = get(row, COLLECTION, "enabled_models")?;
    let enabled_models = models_json
        .map(|raw| from_json::<Vec<String>>(COLLECTION, &raw))
        .transpose()?;
    Ok(ConversationFolder {
        id: get(row, COLLECTION, "id")?,
        name: get(row, COLLECTION, "name")?,
        system_prompt: get(row, COLLECTION, "system_prompt")?,
        memory,
        enabled_models,
        created_at: get_ts(row, COLLECTION, "created_at")?,
        updated_at: get_ts(row, COLLECTION, "updated_at")?,
    })
}

impl SqliteStore {
    /// Insert or overwrite a folder.
    pub async fn put_folder(&self, folder: &ConversationFolder) -> Result<()> {
        let models = folder
            .enabled_models
            .as_ref()
            .map(|m| to_json(COLLECTION, m))
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO folders (id, name, system_prompt, memory, enabled_models, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                memory = excluded.memory,
                enabled_models = excluded.enabled_models,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&folder.id)
        .bind(&folder.name)
        .bind(&folder.system_prompt)
        .bind(to_json(COLLECTION, &folder.memory)?)
        .bind(models)
        .bind(ts(&folder.created_at))
        .bind(ts(&folder.updated_at))
        .execute(&self.pool)
        .await
        .map_err(query_err("UPSERT folder"))?;
        Ok(())
    }

    pub async fn get_folder(&self, id: &str) -> Result<Option<ConversationFolder>> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT folder"))?;
        row.as_ref().map(row_to_folder).transpose()
    }

    /// All folders by name.
    pub async fn list_folders(&self) -> Result<Vec<ConversationFolder>> {
        let rows = sqlx::query("SELECT * FROM folders ORDER BY name COLLATE NOCASE, id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("SELECT folders"))?;
        rows.iter().map(row_to_folder).collect()
    }

    /// Delete a folder and its folder doc, detaching (not deleting) every
    /// tree inside it, in one transaction. Returns the detached tree ids,
    /// or `None` if the folder does not exist.
    pub async fn delete_folder(&self, id: &str) -> Result<Option<Vec<String>>> {
        let mut tx = self.begin().await?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM folders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(tx_err("SELECT folder"))?;
        if exists.is_none() {
            return Ok(None);
        }

        let detached: Vec<(String,)> = sqlx::query_as("SELECT id FROM trees WHERE folder_id = ?1 ORDER BY id")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(tx_err("SELECT folder trees"))?;
        sqlx::query("UPDATE trees SET folder_id = NULL, updated_at = ?2 WHERE folder_id = ?1")
            .bind(id)
            .bind(ts(&Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DETACH trees"))?;
        sqlx::query("DELETE FROM folder_docs WHERE folder_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE folder doc"))?;
        sqlx::query("DELETE FROM folders WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err("DELETE folder"))?;
        commit(tx).await?;

        let detached: Vec<String> = detached.into_iter().map(|(id,)| id).collect();
        debug!(folder_id = id, detached = detached.len(), "Deleted folder");
        Ok(Some(detached))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store;
    use canopy_core::context_box::ContextBox;
    use canopy_core::node::{Node, NodeType};
    use canopy_core::tree::ConversationTree;

    #[tokio::test]
    async fn folder_roundtrip() {
        let store = test_store().await;
        let mut folder = ConversationFolder::new("Research", "You are a research assistant.");
        folder.enabled_models = Some(vec!["gpt-4o".into()]);
        folder.memory.top_k = 3;
        store.put_folder(&folder).await.unwrap();
        assert_eq!(store.get_folder(&folder.id).await.unwrap().unwrap(), folder);
    }

    #[tokio::test]
    async fn delete_folder_detaches_trees() {
        let store = test_store().await;
        let folder = ConversationFolder::new("Work", "prompt");
        store.put_folder(&folder).await.unwrap();

        let root = Node::new(NodeType::System, None, "prompt");
        let tree = ConversationTree::new(root.id.clone(), "t", Some(folder.id.clone()));
        store
            .create_tree(&tree, &root, &ContextBox::new(tree.id.clone(), 100))
            .await
            .unwrap();

        let detached = store.delete_folder(&folder.id).await.unwrap().unwrap();
        assert_eq!(detached, vec![tree.id.clone()]);
        assert!(store.get_folder(&folder.id).await.unwrap().is_none());

        let reloaded = store.get_tree(&tree.id).await.unwrap().unwrap();
        assert_eq!(reloaded.folder_id, None);
        assert!(store.get_node(&root.id).await.unwrap().is_some());
        assert!(store.delete_folder(&folder.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_folders_sorted_by_name() {
        let store = test_store().await;
        store.put_folder(&ConversationFolder::new("beta", "p")).await.unwrap();
        store.put_folder(&ConversationFolder::new("Alpha", "p")).await.unwrap();
        let names: Vec<_> = store.list_folders().await.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["Alpha", "beta"]);
    }
}
