//! Summaries for compressed nodes.

use canopy_core::message::Message;
use canopy_core::node::{Node, NodeType};
use canopy_core::provider::ModelEndpoint;
use canopy_core::think::strip_thinking;

use crate::error::AgentError;
use crate::model::ModelSettings;

const SUMMARY_PROMPT: &str = "Summarize the conversation excerpt below for later reference. \
Keep decisions, facts, names, numbers and open questions. Drop pleasantries. \
Return only the summary.";

/// Ask the model for a summary of `nodes`, in the order given.
pub async fn summarize_nodes(
    endpoint: &dyn ModelEndpoint,
    settings: &ModelSettings,
    nodes: &[&Node],
) -> Result<String, AgentError> {
    if nodes.is_empty() {
        return Err(AgentError::Invalid("nothing to summarize".into()));
    }
    let transcript = nodes
        .iter()
        .map(|n| format!("{}: {}", role_label(n.node_type), n.prompt_text()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let request = settings.request(vec![Message::system(SUMMARY_PROMPT), Message::user(transcript)]);
    let response = endpoint.chat(request).await?;
    let summary = strip_thinking(&response.content).visible.trim().to_string();
    if summary.is_empty() {
        return Err(AgentError::Invalid("model returned an empty summary".into()));
    }
    Ok(summary)
}

fn role_label(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::System => "System",
        NodeType::User => "User",
        NodeType::Assistant => "Assistant",
        NodeType::Compressed => "Earlier summary",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEndpoint;
    use canopy_core::provider::StepEvent;

    #[tokio::test]
    async fn transcript_is_sent_and_summary_trimmed() {
        let endpoint = ScriptedEndpoint::new(vec![vec![StepEvent::AssistantFinal {
            content: " They chose SQLite. ".into(),
        }]]);
        let a = Node::new(NodeType::User, None, "Which database?");
        let b = Node::new(NodeType::Assistant, None, "SQLite fits.");
        let summary = summarize_nodes(&endpoint, &ModelSettings::new("http://x", "m"), &[&a, &b])
            .await
            .unwrap();
        assert_eq!(summary, "They chose SQLite.");
        let sent = endpoint.chats()[0].messages[1].text_content();
        assert_eq!(sent, "User: Which database?\n\nAssistant: SQLite fits.");
    }

    #[tokio::test]
    async fn empty_input_or_output_is_invalid() {
        let endpoint = ScriptedEndpoint::new(Vec::new());
        let settings = ModelSettings::new("http://x", "m");
        assert!(matches!(
            summarize_nodes(&endpoint, &settings, &[]).await,
            Err(AgentError::Invalid(_))
        ));
        let node = Node::new(NodeType::User, None, "hi");
        assert!(matches!(
            summarize_nodes(&endpoint, &settings, &[&node]).await,
            Err(AgentError::Invalid(_))
        ));
    }
}
