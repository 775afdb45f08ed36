//! Versioned long-term documents rendered into prompts.
//!
//! The user profile is a single document; each folder may own one folder
//! doc. `version` is bumped by the docs service on every save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileDoc {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub identity: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for UserProfileDoc {
    fn default() -> Self {
        Self {
            version: 0,
            identity: Vec::new(),
            preferences: Vec::new(),
            constraints: Vec::new(),
            goals: Vec::new(),
            notes: String::new(),
            updated_at: Utc::now(),
        }
    }
}

impl UserProfileDoc {
    pub fn is_empty(&self) -> bool {
        self.identity.is_empty()
            && self.preferences.is_empty()
            && self.constraints.is_empty()
            && self.goals.is_empty()
            && self.notes.trim().is_empty()
    }

    /// Human-readable text for prompt inclusion. Empty sections are omitted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        push_list(&mut out, "Identity", &self.identity);
        push_list(&mut out, "Preferences", &self.preferences);
        push_list(&mut out, "Constraints", &self.constraints);
        push_list(&mut out, "Goals", &self.goals);
        push_text(&mut out, "Notes", &self.notes);
        out.trim_end().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderDoc {
    pub folder_id: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub conventions: Vec<String>,
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub updated_at: DateTime<Utc>,
}

impl FolderDoc {
    pub fn new(folder_id: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
            version: 0,
            summary: String::new(),
            key_facts: Vec::new(),
            conventions: Vec::new(),
            open_loops: Vec::new(),
            notes: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.key_facts.is_empty()
            && self.conventions.is_empty()
            && self.open_loops.is_empty()
            && self.notes.trim().is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        push_text(&mut out, "Summary", &self.summary);
        push_list(&mut out, "Key facts", &self.key_facts);
        push_list(&mut out, "Conventions", &self.conventions);
        push_list(&mut out, "Open loops", &self.open_loops);
        push_text(&mut out, "Notes", &self.notes);
        out.trim_end().to_string()
    }
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    let items: Vec<&str> = items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if items.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push_str(":\n");
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
    out.push('\n');
}

fn push_text(out: &mut String, heading: &str, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push_str(":\n");
    out.push_str(text);
    out.push_str("\n\n");
}
