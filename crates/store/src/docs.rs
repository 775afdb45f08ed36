//! User-profile and folder docs, stored as JSON bodies.

use crate::codec::{from_json, get, to_json};
use crate::{Result, SqliteStore, query_err};
use canopy_core::docs::{FolderDoc, UserProfileDoc};

const PROFILE_ID: &str = "default";

impl SqliteStore {
    pub async fn get_user_profile(&self) -> Result<Option<UserProfileDoc>> {
        let row = sqlx::query("SELECT body FROM user_profile_docs WHERE id = ?1")
            .bind(PROFILE_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT user profile"))?;
        row.map(|r| {
            let body: String = get(&r, "user_profile_docs", "body")?;
            from_json("user_profile_docs", &body)
        })
        .transpose()
    }

    pub async fn put_user_profile(&self, doc: &UserProfileDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_profile_docs (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(PROFILE_ID)
        .bind(to_json("user_profile_docs", doc)?)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPSERT user profile"))?;
        Ok(())
    }

    pub async fn get_folder_doc(&self, folder_id: &str) -> Result<Option<FolderDoc>> {
        let row = sqlx::query("SELECT body FROM folder_docs WHERE folder_id = ?1")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("SELECT folder doc"))?;
        row.map(|r| {
            let body: String = get(&r, "folder_docs", "body")?;
            from_json("folder_docs", &body)
        })
        .transpose()
    }

    pub async fn put_folder_doc(&self, doc: &FolderDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO folder_docs (folder_id, body) VALUES (?1, ?2)
             ON CONFLICT(folder_id) DO UPDATE SET body = excluded.body",
        )
        .bind(&doc.folder_id)
        .bind(to_json("folder_docs", doc)?)
        .execute(&self.pool)
        .await
        .map_err(query_err("UPSERT folder doc"))?;
        Ok(())
    }
}
