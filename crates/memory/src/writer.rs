//! Background memory extraction.
//!
//! After a qualifying turn the writer asks the model for durable facts as a
//! JSON array and upserts each one with provenance pointing at the turn.
//! Failures are logged and never reach the turn that triggered them.

use crate::bank::MemoryBank;
use canopy_core::memory::{Confidence, MemoryItem, MemoryScope, MemorySource};
use canopy_core::message::Message;
use canopy_core::provider::{ChatRequest, ModelEndpoint};
use canopy_core::think::strip_thinking;
use canopy_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EXTRACTION_PROMPT: &str = "You extract durable long-term memories from a conversation turn. \
Return ONLY a JSON array. Each element is an object with: \
\"text\" (one atomic fact or preference about the user, written in third person), \
\"tags\" (array of short lowercase topics), \
\"confidence\" (\"low\", \"medium\" or \"high\"), \
\"scope\" (\"user\" for facts about the person, \"folder\" for facts only relevant to this project). \
Skip small talk, transient requests and anything the assistant said that the user did not confirm. \
Return [] when nothing is worth remembering.";

/// Model call parameters for extraction.
#[derive(Clone)]
pub struct WriterSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Both sides of a turn must be at least this many characters.
    pub min_chars: usize,
}

impl std::fmt::Debug for WriterSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("min_chars", &self.min_chars)
            .finish()
    }
}

/// A finished turn offered to the writer.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub tree_id: String,
    pub folder_id: Option<String>,
    pub user_node_id: String,
    pub assistant_node_id: String,
    pub user_text: String,
    pub assistant_text: String,
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    text: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

pub struct MemoryWriter {
    bank: Arc<MemoryBank>,
    endpoint: Arc<dyn ModelEndpoint>,
    settings: WriterSettings,
}

impl MemoryWriter {
    pub fn new(bank: Arc<MemoryBank>, endpoint: Arc<dyn ModelEndpoint>, settings: WriterSettings) -> Self {
        Self {
            bank,
            endpoint,
            settings,
        }
    }

    pub fn should_write(&self, turn: &TurnRecord) -> bool {
        let min = self.settings.min_chars;
        turn.user_text.trim().chars().count() >= min && turn.assistant_text.trim().chars().count() >= min
    }

    /// Run extraction on a background task. Returns `None` when the turn
    /// does not qualify.
    pub fn spawn(self: &Arc<Self>, turn: TurnRecord) -> Option<JoinHandle<()>> {
        if !self.should_write(&turn) {
            debug!(tree_id = %turn.tree_id, "Turn too short for memory extraction");
            return None;
        }
        let writer = Arc::clone(self);
        Some(tokio::spawn(async move {
            match writer.write(&turn).await {
                Ok(items) => info!(tree_id = %turn.tree_id, stored = items.len(), "Memory extraction finished"),
                Err(e) => warn!(tree_id = %turn.tree_id, error = %e, "Memory extraction failed"),
            }
        }))
    }

    /// Extract and store facts from `turn`. Individual facts that fail to
    /// store are skipped with a warning.
    pub async fn write(&self, turn: &TurnRecord) -> Result<Vec<MemoryItem>> {
        let exchange = format!(
            "User:\n{}\n\nAssistant:\n{}",
            turn.user_text.trim(),
            turn.assistant_text.trim()
        );
        let request = ChatRequest::new(
            &self.settings.base_url,
            &self.settings.model,
            vec![Message::system(EXTRACTION_PROMPT), Message::user(exchange)],
        )
        .with_api_key(&self.settings.api_key)
        .with_temperature(0.0);
        request.validate()?;
        let response = self.endpoint.chat(request).await?;

        let facts = parse_facts(&response.content)?;
        let mut stored = Vec::with_capacity(facts.len());
        for fact in facts {
            let text = fact.text.trim();
            if text.is_empty() {
                continue;
            }
            let scope = match (fact.scope.as_deref(), &turn.folder_id) {
                (Some("folder"), Some(folder_id)) => MemoryScope::Folder {
                    folder_id: folder_id.clone(),
                },
                _ => MemoryScope::User,
            };
            let confidence = fact
                .confidence
                .as_deref()
                .and_then(|c| Confidence::parse(&c.to_lowercase()))
                .unwrap_or_default();
            let item = MemoryItem::new(scope, text)
                .with_tags(fact.tags)
                .with_confidence(confidence)
                .with_source(MemorySource {
                    tree_id: Some(turn.tree_id.clone()),
                    node_ids: vec![turn.user_node_id.clone(), turn.assistant_node_id.clone()],
                    origin: Some("auto".into()),
                });
            match self.bank.upsert(item).await {
                Ok(item) => stored.push(item),
                Err(e) => warn!(tree_id = %turn.tree_id, error = %e, "Skipping extracted memory"),
            }
        }
        Ok(stored)
    }
}

fn parse_facts(content: &str) -> Result<Vec<ExtractedFact>> {
    let visible = strip_thinking(content).visible;
    let value = extract_json(&visible)
        .ok_or_else(|| Error::Internal("memory extraction returned no JSON".into()))?;
    let array = match value {
        Value::Array(_) => value,
        // tolerate {"memories": [...]}
        Value::Object(mut map) => map
            .remove("memories")
            .or_else(|| map.remove("facts"))
            .unwrap_or(Value::Array(Vec::new())),
        _ => Value::Array(Vec::new()),
    };
    Ok(serde_json::from_value(array)?)
}

/// Find the first JSON value in model output: a fenced code block first,
/// then the first balanced `[...]` or `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(value) = from_code_block(text) {
        return Some(value);
    }
    let start = text.find(['[', '{'])?;
    let span = balanced_span(&text[start..])?;
    serde_json::from_str(span).ok()
}

fn from_code_block(text: &str) -> Option<Value> {
    let start = text.find("```")? + 3;
    // skip the language tag line
    let body_start = text[start..].find('\n').map_or(start, |i| start + i + 1);
    let end = text[body_start..].find("```")?;
    serde_json::from_str(text[body_start..body_start + end].trim()).ok()
}

/// The shortest prefix of `text` whose brackets balance, ignoring brackets
/// inside string literals.
fn balanced_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
