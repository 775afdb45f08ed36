//! Long-term memory items.
//!
//! A memory item is one atomic fact or preference. Items are created and
//! updated only through the memory bank's upsert path; everything else reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a memory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemoryScope {
    /// Applies to every conversation.
    User,
    /// Applies only to trees inside one folder.
    #[serde(rename_all = "camelCase")]
    Folder { folder_id: String },
}

impl MemoryScope {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryScope::User => "user",
            MemoryScope::Folder { .. } => "folder",
        }
    }

    pub fn folder_id(&self) -> Option<&str> {
        match self {
            MemoryScope::User => None,
            MemoryScope::Folder { folder_id } => Some(folder_id),
        }
    }

    pub fn from_parts(kind: &str, folder_id: Option<String>) -> Option<Self> {
        match (kind, folder_id) {
            ("user", _) => Some(MemoryScope::User),
            ("folder", Some(folder_id)) => Some(MemoryScope::Folder { folder_id }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    #[default]
    Active,
    Archived,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MemoryStatus::Active),
            "archived" => Some(MemoryStatus::Archived),
            _ => None,
        }
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,
    /// Free-form origin label, e.g. "manual" or "auto".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    pub scope: MemoryScope,
    pub text: String,
    /// Kept sorted and unique.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub status: MemoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<MemorySource>,
}

impl MemoryItem {
    pub fn new(scope: MemoryScope, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            scope,
            text: text.into(),
            tags: Vec::new(),
            confidence: Confidence::default(),
            status: MemoryStatus::Active,
            created_at: now,
            updated_at: now,
            sources: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.normalize_tags();
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.sources.push(source);
        self
    }

    /// Lowercase, trim, sort and dedupe the tag list.
    pub fn normalize_tags(&mut self) {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        self.tags = tags;
    }

    pub fn is_active(&self) -> bool {
        self.status == MemoryStatus::Active
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter()
            .all(|wanted| self.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted.trim())))
    }
}
