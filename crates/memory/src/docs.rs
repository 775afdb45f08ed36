//! Long-term documents: the user profile and one doc per folder.
//!
//! Saving bumps `version` from the stored copy and stamps `updated_at`, so
//! a caller holding a stale doc never moves the version backwards.

use canopy_core::Result;
use canopy_core::docs::{FolderDoc, UserProfileDoc};
use canopy_store::SqliteStore;
use chrono::Utc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DocsService {
    store: SqliteStore,
}

impl DocsService {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// The stored profile, or an empty version-0 profile.
    pub async fn profile(&self) -> Result<UserProfileDoc> {
        Ok(self.store.get_user_profile().await?.unwrap_or_default())
    }

    pub async fn save_profile(&self, mut doc: UserProfileDoc) -> Result<UserProfileDoc> {
        let stored = self.store.get_user_profile().await?.map_or(0, |d| d.version);
        doc.version = stored.max(doc.version) + 1;
        doc.updated_at = Utc::now();
        self.store.put_user_profile(&doc).await?;
        debug!(version = doc.version, "Saved user profile");
        Ok(doc)
    }

    pub async fn folder_doc(&self, folder_id: &str) -> Result<FolderDoc> {
        Ok(self
            .store
            .get_folder_doc(folder_id)
            .await?
            .unwrap_or_else(|| FolderDoc::new(folder_id)))
    }

    pub async fn save_folder_doc(&self, mut doc: FolderDoc) -> Result<FolderDoc> {
        let stored = self
            .store
            .get_folder_doc(&doc.folder_id)
            .await?
            .map_or(0, |d| d.version);
        doc.version = stored.max(doc.version) + 1;
        doc.updated_at = Utc::now();
        self.store.put_folder_doc(&doc).await?;
        debug!(folder_id = %doc.folder_id, version = doc.version, "Saved folder doc");
        Ok(doc)
    }
}
