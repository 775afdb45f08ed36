//! Model classification.
//!
//! Endpoints list every model they host; the UI only offers chat-capable
//! ones and the memory bank needs an embedding model. Rules are evaluated
//! top to bottom against the lowercased model id; the first match wins and
//! anything unmatched is a chat model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Embedding,
    Reasoning,
    Image,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Prefix,
    Contains,
}

struct Rule {
    pattern: &'static str,
    matcher: Match,
    category: ModelCategory,
}

const fn rule(pattern: &'static str, matcher: Match, category: ModelCategory) -> Rule {
    Rule {
        pattern,
        matcher,
        category,
    }
}

const RULES: &[Rule] = &[
    rule("embed", Match::Contains, ModelCategory::Embedding),
    rule("bge-", Match::Contains, ModelCategory::Embedding),
    rule("e5-", Match::Contains, ModelCategory::Embedding),
    rule("dall-e", Match::Prefix, ModelCategory::Image),
    rule("gpt-image", Match::Prefix, ModelCategory::Image),
    rule("stable-diffusion", Match::Contains, ModelCategory::Image),
    rule("flux", Match::Contains, ModelCategory::Image),
    rule("imagen", Match::Contains, ModelCategory::Image),
    rule("o1", Match::Prefix, ModelCategory::Reasoning),
    rule("o3", Match::Prefix, ModelCategory::Reasoning),
    rule("o4", Match::Prefix, ModelCategory::Reasoning),
    rule("deepseek-r1", Match::Contains, ModelCategory::Reasoning),
    rule("deepseek-reasoner", Match::Contains, ModelCategory::Reasoning),
    rule("qwq", Match::Contains, ModelCategory::Reasoning),
    rule("thinking", Match::Contains, ModelCategory::Reasoning),
];

/// Models that reject `tools` in the request.
const NO_TOOLS: &[&str] = &["o1-mini", "o1-preview", "deepseek-r1", "deepseek-reasoner", "gemma"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub category: ModelCategory,
    pub supports_tools: bool,
}

pub fn classify(model_id: &str) -> ModelCategory {
    let id = bare_id(model_id);
    RULES
        .iter()
        .find(|r| match r.matcher {
            Match::Prefix => id.starts_with(r.pattern),
            Match::Contains => id.contains(r.pattern),
        })
        .map_or(ModelCategory::Chat, |r| r.category)
}

pub fn model_info(model_id: &str) -> ModelInfo {
    let category = classify(model_id);
    let id = bare_id(model_id);
    let supports_tools = matches!(category, ModelCategory::Chat | ModelCategory::Reasoning)
        && !NO_TOOLS.iter().any(|p| id.contains(p));
    ModelInfo {
        id: model_id.to_string(),
        category,
        supports_tools,
    }
}

/// Models a user can chat with, in input order.
pub fn chat_models<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    ids.into_iter()
        .filter(|id| matches!(classify(id), ModelCategory::Chat | ModelCategory::Reasoning))
        .collect()
}

/// Lowercased id without a vendor prefix (`openai/o3-mini` → `o3-mini`).
fn bare_id(model_id: &str) -> String {
    let lower = model_id.trim().to_lowercase();
    match lower.rsplit_once('/') {
        Some((_, tail)) => tail.to_string(),
        None => lower,
    }
}
