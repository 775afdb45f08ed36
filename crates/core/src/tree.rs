//! Conversation trees and the folders that group them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root prompt for trees created outside any folder.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Folder names are cut to this many characters.
pub const MAX_FOLDER_NAME_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTree {
    pub id: String,
    /// Always references a `system` node.
    pub root_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationTree {
    pub fn new(root_id: impl Into<String>, title: impl Into<String>, folder_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            root_id: root_id.into(),
            title: title.into(),
            folder_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How long-term memory is retrieved for trees inside a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMemorySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Only surface memories updated within this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
    /// Also search user-scoped memories, not only this folder's.
    #[serde(default = "default_true")]
    pub include_user_scope: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    8
}

impl Default for FolderMemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            max_age_days: None,
            include_user_scope: true,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFolder {
    pub id: String,
    pub name: String,
    /// Content of the root node of every tree inside this folder.
    pub system_prompt: String,
    #[serde(default)]
    pub memory: FolderMemorySettings,
    /// `None` means every model is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_models: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationFolder {
    pub fn new(name: &str, system_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: bound_folder_name(name),
            system_prompt: system_prompt.into(),
            memory: FolderMemorySettings::default(),
            enabled_models: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allows_model(&self, model: &str) -> bool {
        match &self.enabled_models {
            Some(models) => models.iter().any(|m| m == model),
            None => true,
        }
    }
}

/// Trim and cut a folder name to [`MAX_FOLDER_NAME_CHARS`] characters.
pub fn bound_folder_name(name: &str) -> String {
    name.trim().chars().take(MAX_FOLDER_NAME_CHARS).collect()
}
