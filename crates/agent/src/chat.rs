//! One user turn, end to end.
//!
//! The service assembles context for the open tree, persists the user
//! node, runs the agent loop, persists exactly one assistant node carrying
//! every tool log from the turn, and hands qualifying turns to the memory
//! writer. A loop failure leaves the user node in place and comes back as a
//! [`TurnFailure`] naming it.

use std::sync::Arc;

use canopy_conversation::{NewNode, Workspace};
use canopy_core::event::DomainEvent;
use canopy_core::message::Message;
use canopy_core::node::{Node, NodeMetadata, NodeType};
use canopy_core::provider::ModelEndpoint;
use canopy_core::think::strip_thinking;
use canopy_core::tool::ToolSettings;
use canopy_core::tree::FolderMemorySettings;
use canopy_memory::{DocsService, InjectionLimits, MemoryBank, MemoryWriter, TurnRecord, query_for_folder, select_injection};
use canopy_providers::model_info;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{AssembledContext, AssemblyInput, ContextAssembler, SyntheticBlock};
use crate::error::{AgentError, TurnFailure};
use crate::loop_runner::{AgentLoop, RunOptions};
use crate::model::ModelSettings;
use crate::summarize::summarize_nodes;

pub const DEFAULT_RECENT_MESSAGES: usize = 12;

/// What the caller asks for in one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub text: String,
    /// Tool names offered to the model for this turn.
    pub tool_uses: Vec<String>,
    /// Overrides the configured model.
    pub model: Option<String>,
    pub options: RunOptions,
}

impl TurnRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_uses = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub user_node: Node,
    pub assistant_node: Node,
    pub steps: usize,
    pub hit_step_limit: bool,
    pub context_tokens: usize,
    /// Background memory extraction, when the turn qualified.
    pub memory_task: Option<JoinHandle<()>>,
}

/// Where synthetic memory blocks come from.
pub struct MemorySources {
    pub bank: Arc<MemoryBank>,
    pub docs: DocsService,
    pub limits: InjectionLimits,
}

pub struct ChatService {
    agent: AgentLoop,
    endpoint: Arc<dyn ModelEndpoint>,
    settings: ModelSettings,
    tool_settings: ToolSettings,
    memory: Option<MemorySources>,
    writer: Option<Arc<MemoryWriter>>,
    recent_messages: usize,
    assembler: ContextAssembler,
}

impl ChatService {
    pub fn new(agent: AgentLoop, endpoint: Arc<dyn ModelEndpoint>, settings: ModelSettings) -> Self {
        Self {
            agent,
            endpoint,
            settings,
            tool_settings: ToolSettings::default(),
            memory: None,
            writer: None,
            recent_messages: DEFAULT_RECENT_MESSAGES,
            assembler: ContextAssembler::new(),
        }
    }

    pub fn with_tool_settings(mut self, tool_settings: ToolSettings) -> Self {
        self.tool_settings = tool_settings;
        self
    }

    pub fn with_memory(mut self, memory: MemorySources) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_writer(mut self, writer: Arc<MemoryWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_recent_messages(mut self, count: usize) -> Self {
        self.recent_messages = count;
        self
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Assemble the context the next turn in the open tree would send,
    /// with `query` driving memory retrieval.
    pub async fn build_context(&self, workspace: &Workspace, query: &str) -> Result<AssembledContext, AgentError> {
        let snapshot = workspace
            .snapshot()
            .ok_or_else(|| AgentError::Invalid("no tree is open".into()))?;

        let mut synthetic = self.memory_blocks(workspace, query).await;

        let cb = &snapshot.context_box;
        let path = workspace.active_path();
        let recent: Vec<Node> = path
            .iter()
            .filter(|n| !n.is_root() && !cb.contains_node(&n.id))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(self.recent_messages)
            .rev()
            .map(|n| (*n).clone())
            .collect();
        if !recent.is_empty() {
            synthetic.push(SyntheticBlock::RecentMessages(recent));
        }

        Ok(self.assembler.assemble(&AssemblyInput {
            context_box: cb,
            nodes: &snapshot.nodes,
            synthetic: &synthetic,
        }))
    }

    /// Profile, folder doc and memory blocks. Read failures are logged and
    /// leave the block out.
    async fn memory_blocks(&self, workspace: &Workspace, query: &str) -> Vec<SyntheticBlock> {
        let (Some(memory), Some(snapshot)) = (&self.memory, workspace.snapshot()) else {
            return Vec::new();
        };
        let folder = snapshot.folder.as_ref();
        let settings = folder.map(|f| f.memory.clone()).unwrap_or_else(FolderMemorySettings::default);
        if !settings.enabled {
            return Vec::new();
        }
        let mut blocks = Vec::new();

        match memory.docs.profile().await {
            Ok(profile) if !profile.is_empty() => blocks.push(SyntheticBlock::Profile(profile)),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not load user profile"),
        }
        if let Some(folder) = folder {
            match memory.docs.folder_doc(&folder.id).await {
                Ok(doc) if !doc.is_empty() => blocks.push(SyntheticBlock::FolderDoc(doc)),
                Ok(_) => {}
                Err(e) => warn!(folder_id = %folder.id, error = %e, "Could not load folder doc"),
            }
        }

        let query = query_for_folder(query, folder.map(|f| f.id.as_str()), &settings, Utc::now());
        match select_injection(&memory.bank, &snapshot.context_box.pinned_memory_ids, &query, memory.limits).await {
            Ok(injection) if !injection.is_empty() => {
                blocks.push(SyntheticBlock::Memories(injection.items().cloned().collect()));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Memory retrieval failed"),
        }
        blocks
    }

    /// Run one turn in the open tree, branching from the active node.
    pub async fn send(&self, workspace: &mut Workspace, turn: TurnRequest) -> Result<TurnOutcome, TurnFailure> {
        let text = turn.text.trim().to_string();
        if text.is_empty() {
            return Err(TurnFailure::before_persist(AgentError::Invalid("message is empty".into())));
        }
        if let Some(unknown) = turn.tool_uses.iter().find(|t| !self.agent.tools().contains(t)) {
            return Err(TurnFailure::before_persist(AgentError::Invalid(format!(
                "unknown tool '{unknown}'"
            ))));
        }
        let model = turn.model.clone().unwrap_or_else(|| self.settings.model.clone());
        if !turn.tool_uses.is_empty() && !model_info(&model).supports_tools {
            return Err(TurnFailure::before_persist(AgentError::Invalid(format!(
                "model '{model}' does not support tools"
            ))));
        }
        let (tree_id, folder_id, parent_id) = {
            let snapshot = workspace
                .snapshot()
                .ok_or_else(|| TurnFailure::before_persist(AgentError::Invalid("no tree is open".into())))?;
            if let Some(folder) = snapshot.folder.as_ref().filter(|f| !f.allows_model(&model)) {
                return Err(TurnFailure::before_persist(AgentError::Invalid(format!(
                    "model '{model}' is not enabled in folder '{}'",
                    folder.name
                ))));
            }
            let parent = workspace
                .active_node_id()
                .unwrap_or(snapshot.tree.root_id.as_str())
                .to_string();
            (snapshot.tree.id.clone(), snapshot.tree.folder_id.clone(), parent)
        };

        let context = self.build_context(workspace, &text).await.map_err(TurnFailure::before_persist)?;
        if context.is_over_budget() {
            info!(tree_id = %tree_id, total = context.total_tokens, max = context.max_tokens, "Sending over-budget context");
        }

        let user_node = workspace
            .append_node(NewNode::child(NodeType::User, &parent_id, &text).with_metadata(NodeMetadata {
                tool_uses: turn.tool_uses.clone(),
                model_id: Some(model.clone()),
                ..Default::default()
            }))
            .await
            .map_err(TurnFailure::before_persist)?;

        let mut messages = context.messages;
        messages.push(Message::user(&text));
        let request = self.settings.clone().with_model(&model).request(messages);

        let outcome = match self
            .agent
            .run(request, &turn.tool_uses, &self.tool_settings, &turn.options)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tree_id = %tree_id, user_node_id = %user_node.id, error = %e, "Turn failed");
                workspace.events().publish(DomainEvent::ErrorOccurred {
                    context: format!("turn in tree {tree_id}"),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(TurnFailure::after_persist(&user_node.id, e));
            }
        };

        let stripped = strip_thinking(&outcome.content);
        let reply = stripped.visible.trim().to_string();
        let assistant_node = workspace
            .append_node(
                NewNode::child(NodeType::Assistant, &user_node.id, &reply).with_metadata(NodeMetadata {
                    model_id: Some(model),
                    provider_id: Some(self.endpoint.name().to_string()),
                    tool_logs: outcome.tool_logs,
                    thinking: stripped.thinking,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| TurnFailure::after_persist(&user_node.id, e))?;
        workspace
            .complete_turn(&user_node.id, &assistant_node.id, outcome.steps)
            .map_err(|e| TurnFailure::after_persist(&user_node.id, e))?;
        debug!(tree_id = %tree_id, steps = outcome.steps, "Turn persisted");

        let memory_task = self.spawn_memory_write(workspace, TurnRecord {
            tree_id,
            folder_id,
            user_node_id: user_node.id.clone(),
            assistant_node_id: assistant_node.id.clone(),
            user_text: text,
            assistant_text: reply,
        });

        Ok(TurnOutcome {
            user_node,
            assistant_node,
            steps: outcome.steps,
            hit_step_limit: outcome.hit_step_limit,
            context_tokens: context.total_tokens,
            memory_task,
        })
    }

    fn spawn_memory_write(&self, workspace: &Workspace, turn: TurnRecord) -> Option<JoinHandle<()>> {
        let writer = self.writer.as_ref()?;
        let enabled = workspace
            .snapshot()
            .and_then(|s| s.folder.as_ref())
            .is_none_or(|f| f.memory.enabled);
        if !enabled {
            return None;
        }
        writer.spawn(turn)
    }

    /// Replace `node_ids` in the open tree with one compressed node whose
    /// summary comes from the model.
    pub async fn compress(&self, workspace: &mut Workspace, node_ids: &[String]) -> Result<Node, AgentError> {
        let snapshot = workspace
            .snapshot()
            .ok_or_else(|| AgentError::Invalid("no tree is open".into()))?;
        let nodes = node_ids
            .iter()
            .map(|id| {
                snapshot
                    .node(id)
                    .ok_or_else(|| AgentError::Core(canopy_core::Error::not_found("node", id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let summary = summarize_nodes(self.endpoint.as_ref(), &self.settings, &nodes).await?;
        Ok(workspace.compress(node_ids, &summary).await?)
    }
}
