//! Folder management.
//!
//! Changing a folder's prompt never rewrites stored root nodes. Trees pick
//! the new prompt up the next time they are loaded.

use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::tree::{ConversationFolder, DEFAULT_SYSTEM_PROMPT, FolderMemorySettings, bound_folder_name};
use canopy_core::{Error, Result};
use canopy_store::SqliteStore;
use chrono::Utc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct FolderService {
    store: SqliteStore,
    events: EventBus,
}

impl FolderService {
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, name: &str, system_prompt: Option<&str>) -> Result<ConversationFolder> {
        let name = checked_name(name)?;
        let prompt = system_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let folder = ConversationFolder::new(&name, prompt);
        self.store.put_folder(&folder).await?;
        info!(folder_id = %folder.id, name = %folder.name, "Created folder");
        self.publish_changed(&folder);
        Ok(folder)
    }

    pub async fn get(&self, folder_id: &str) -> Result<ConversationFolder> {
        self.store
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| Error::not_found("folder", folder_id))
    }

    pub async fn list(&self) -> Result<Vec<ConversationFolder>> {
        Ok(self.store.list_folders().await?)
    }

    pub async fn rename(&self, folder_id: &str, name: &str) -> Result<ConversationFolder> {
        let name = checked_name(name)?;
        self.modify(folder_id, |f| f.name = name).await
    }

    pub async fn update_system_prompt(&self, folder_id: &str, prompt: &str) -> Result<ConversationFolder> {
        if prompt.trim().is_empty() {
            return Err(Error::Validation("system prompt cannot be empty".into()));
        }
        self.modify(folder_id, |f| f.system_prompt = prompt.to_string())
            .await
    }

    pub async fn update_memory_settings(
        &self,
        folder_id: &str,
        settings: FolderMemorySettings,
    ) -> Result<ConversationFolder> {
        if settings.top_k == 0 {
            return Err(Error::Validation("memory top_k must be positive".into()));
        }
        self.modify(folder_id, |f| f.memory = settings).await
    }

    /// Restrict the folder to `models`, or allow every model with `None`.
    pub async fn set_enabled_models(&self, folder_id: &str, models: Option<Vec<String>>) -> Result<ConversationFolder> {
        self.modify(folder_id, |f| f.enabled_models = models).await
    }

    /// Delete the folder. Its trees become top-level trees; the ids of the
    /// detached trees are returned.
    pub async fn delete(&self, folder_id: &str) -> Result<Vec<String>> {
        let detached = self
            .store
            .delete_folder(folder_id)
            .await?
            .ok_or_else(|| Error::not_found("folder", folder_id))?;
        info!(folder_id, detached = detached.len(), "Deleted folder");
        self.events.publish(DomainEvent::FolderDeleted {
            folder_id: folder_id.to_string(),
            detached_tree_ids: detached.clone(),
            timestamp: Utc::now(),
        });
        Ok(detached)
    }

    async fn modify(&self, folder_id: &str, edit: impl FnOnce(&mut ConversationFolder)) -> Result<ConversationFolder> {
        let mut folder = self.get(folder_id).await?;
        edit(&mut folder);
        folder.updated_at = Utc::now();
        self.store.put_folder(&folder).await?;
        self.publish_changed(&folder);
        Ok(folder)
    }

    fn publish_changed(&self, folder: &ConversationFolder) {
        self.events.publish(DomainEvent::FolderChanged {
            folder_id: folder.id.clone(),
            timestamp: folder.updated_at,
        });
    }
}

fn checked_name(name: &str) -> Result<String> {
    let name = bound_folder_name(name);
    if name.is_empty() {
        return Err(Error::Validation("folder name cannot be empty".into()));
    }
    Ok(name)
}
