//! End-to-end integration tests for Canopy.
//!
//! These tests exercise the full pipeline from tree creation through a
//! turn to the persisted nodes, including tool execution, memory, and the
//! HTTP gateway.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use canopy_agent::{AgentError, AgentLoop, ChatService, MemorySources, ModelSettings, TurnRequest};
use canopy_conversation::Workspace;
use canopy_core::error::{ProviderError, ToolError};
use canopy_core::event::EventBus;
use canopy_core::memory::{MemoryItem, MemoryScope};
use canopy_core::message::Role;
use canopy_core::node::{NodeType, ToolCallStatus};
use canopy_core::provider::{
    AgentStepRequest, ChatRequest, ChatResponse, ModelEndpoint, StepEvent, StepStream, ToolCallRequest,
};
use canopy_core::tool::{Tool, ToolRegistry, ToolResult};
use canopy_memory::{DocsService, InjectionLimits, MemoryBank, MemoryQuery, MemoryWriter, WriterSettings};
use canopy_store::SqliteStore;
use tokio::sync::mpsc;

// ── Mock endpoint ────────────────────────────────────────────────────────

/// Returns scripted step events for agent steps and scripted text for
/// plain chat calls, in order.
struct ScriptedProvider {
    steps: Mutex<VecDeque<Vec<StepEvent>>>,
    chats: Mutex<VecDeque<String>>,
    step_requests: Mutex<Vec<AgentStepRequest>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Vec<StepEvent>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            chats: Mutex::new(VecDeque::new()),
            step_requests: Mutex::new(Vec::new()),
        }
    }

    fn with_chat_replies(self, replies: Vec<&str>) -> Self {
        *self.chats.lock().unwrap() = replies.into_iter().map(String::from).collect();
        self
    }

    fn step_calls(&self) -> usize {
        self.step_requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ModelEndpoint for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let content = self
            .chats
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedProvider has no chat reply left"));
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
        })
    }

    async fn agent_step(&self, request: AgentStepRequest) -> Result<StepStream, ProviderError> {
        let script = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedProvider exhausted after {} steps", self.step_calls()));
        self.step_requests.lock().unwrap().push(request);
        let (tx, rx) = mpsc::channel(script.len() + 1);
        for event in script {
            tx.try_send(Ok(event)).unwrap();
        }
        tx.try_send(Ok(StepEvent::End)).unwrap();
        Ok(rx)
    }
}

fn answer(text: &str) -> Vec<StepEvent> {
    vec![
        StepEvent::AssistantDelta { delta: "…".into() },
        StepEvent::AssistantFinal { content: text.into() },
    ]
}

fn tool_call(name: &str, args: serde_json::Value) -> Vec<StepEvent> {
    vec![StepEvent::ToolCall {
        call: ToolCallRequest {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments: args,
        },
    }]
}

// ── Test tool ────────────────────────────────────────────────────────────

/// Looks up a fixed population figure.
struct PopulationTool;

#[async_trait::async_trait]
impl Tool for PopulationTool {
    fn name(&self) -> &str {
        "population"
    }

    fn description(&self) -> &str {
        "Population of a city"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        })
    }

    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        match arguments["city"].as_str() {
            Some("Lisbon") => Ok(ToolResult::ok(call_id, "545,000")),
            Some(other) => Err(ToolError::ExecutionFailed {
                tool_name: "population".into(),
                reason: format!("no data for {other}"),
            }),
            None => Err(ToolError::InvalidArguments("city is required".into())),
        }
    }
}

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(PopulationTool));
    Arc::new(registry)
}

async fn setup() -> (SqliteStore, EventBus) {
    let store = SqliteStore::new("sqlite::memory:").await.unwrap();
    (store, EventBus::default())
}

fn chat_service(endpoint: Arc<dyn ModelEndpoint>, events: &EventBus) -> ChatService {
    let agent = AgentLoop::new(endpoint.clone(), registry(), events.clone());
    ChatService::new(agent, endpoint, ModelSettings::new("http://localhost:1", "mock-model"))
}

// ── E2E: turns ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_tool_turn_persists_one_assistant_node() {
    let (store, events) = setup().await;
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("population", serde_json::json!({"city": "Lisbon"})),
        answer("Lisbon has about 545,000 residents."),
    ]));
    let service = chat_service(provider.clone(), &events);

    let mut ws = Workspace::new(store.clone(), events.clone());
    let tree_id = ws.create_tree("Cities", None).await.unwrap().tree.id.clone();

    let outcome = service
        .send(&mut ws, TurnRequest::new("How many people live in Lisbon?").with_tools(["population"]))
        .await
        .expect("turn should succeed");

    assert_eq!(provider.step_calls(), 2);
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.assistant_node.content, "Lisbon has about 545,000 residents.");

    // the second step saw the tool result
    let second = &provider.step_requests.lock().unwrap()[1];
    let tool_msg = second.chat.messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.text_content(), "545,000");

    // reopen from the store
    let mut fresh = Workspace::new(store, events);
    let snapshot = fresh.open_tree(&tree_id).await.unwrap();
    assert_eq!(snapshot.nodes.len(), 3);
    let assistant = snapshot.node(&outcome.assistant_node.id).unwrap();
    assert_eq!(assistant.metadata.tool_logs.len(), 1);
    assert_eq!(assistant.metadata.tool_logs[0].status, ToolCallStatus::Success);
    assert_eq!(assistant.metadata.tool_logs[0].output.as_deref(), Some("545,000"));
    let user = snapshot.node(&outcome.user_node.id).unwrap();
    assert_eq!(user.metadata.tool_uses, vec!["population"]);
    assert_eq!(fresh.active_node_id(), Some(outcome.assistant_node.id.as_str()));
}

#[tokio::test]
async fn e2e_failing_tool_is_logged_not_fatal() {
    let (store, events) = setup().await;
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call("population", serde_json::json!({"city": "Atlantis"})),
        answer("I could not find that city."),
    ]));
    let service = chat_service(provider, &events);
    let mut ws = Workspace::new(store, events.clone());
    ws.create_tree("Cities", None).await.unwrap();

    let outcome = service
        .send(&mut ws, TurnRequest::new("Population of Atlantis?").with_tools(["population"]))
        .await
        .unwrap();
    let log = &outcome.assistant_node.metadata.tool_logs[0];
    assert_eq!(log.status, ToolCallStatus::Error);
    assert!(log.error.as_deref().unwrap().contains("Atlantis"));
}

#[tokio::test]
async fn e2e_branching_and_compression() {
    let (store, events) = setup().await;
    let provider = Arc::new(
        ScriptedProvider::new(vec![answer("A1"), answer("A2"), answer("B1")])
            .with_chat_replies(vec!["Discussed A twice."]),
    );
    let service = chat_service(provider, &events);
    let mut ws = Workspace::new(store, events);
    let root_id = ws.create_tree("Branches", None).await.unwrap().tree.root_id.clone();

    let first = service.send(&mut ws, TurnRequest::new("Q1")).await.unwrap();
    let second = service.send(&mut ws, TurnRequest::new("Q2")).await.unwrap();
    assert_eq!(second.user_node.parent_id.as_deref(), Some(first.assistant_node.id.as_str()));

    // branch from the root
    ws.set_active_node(Some(root_id.as_str())).unwrap();
    service.send(&mut ws, TurnRequest::new("Other topic")).await.unwrap();
    assert_eq!(ws.branch_count(), 2);

    let ids: Vec<String> = [&first.user_node, &first.assistant_node, &second.user_node, &second.assistant_node]
        .iter()
        .map(|n| n.id.clone())
        .collect();
    let compressed = service.compress(&mut ws, &ids).await.unwrap();
    assert_eq!(compressed.node_type, NodeType::Compressed);
    assert_eq!(compressed.prompt_text(), "Discussed A twice.");
    assert_eq!(compressed.metadata.compressed_node_ids, ids);
    assert_eq!(ws.active_node_id(), Some(compressed.id.as_str()));
}

#[tokio::test]
async fn e2e_folder_prompt_and_model_allowlist() {
    let (store, events) = setup().await;
    let provider = Arc::new(ScriptedProvider::new(vec![answer("ok")]));
    let service = chat_service(provider.clone(), &events);
    let mut ws = Workspace::new(store, events);

    let folder = ws.folders().create("Work", Some("You are terse.")).await.unwrap();
    ws.folders()
        .set_enabled_models(&folder.id, Some(vec!["mock-model".into()]))
        .await
        .unwrap();
    ws.create_tree("Standup", Some(&folder.id)).await.unwrap();

    let err = service
        .send(&mut ws, TurnRequest::new("hi").with_model("other-model"))
        .await
        .unwrap_err();
    assert!(err.user_node_id.is_none());
    assert!(matches!(err.source, AgentError::Invalid(_)));
    assert_eq!(provider.step_calls(), 0);

    ws.update_folder_prompt(&folder.id, "You are thorough.").await.unwrap();
    service.send(&mut ws, TurnRequest::new("hi")).await.unwrap();
    let sent = &provider.step_requests.lock().unwrap()[0].chat.messages;
    assert_eq!(sent[0].text_content(), "You are thorough.");
}

// ── E2E: memory ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_memory_is_injected_and_written_back() {
    let (store, events) = setup().await;
    let bank = Arc::new(MemoryBank::new(store.clone(), events.clone()));
    bank.upsert(MemoryItem::new(MemoryScope::User, "The user lives in Porto"))
        .await
        .unwrap();

    let provider = Arc::new(
        ScriptedProvider::new(vec![answer(
            "Porto has mild winters, so a light jacket is usually enough for your commute.",
        )])
        .with_chat_replies(vec![
            "```json\n[{\"text\": \"The user commutes by bike\", \"tags\": [\"Travel\"], \"confidence\": \"high\"}]\n```",
        ]),
    );
    let writer = Arc::new(MemoryWriter::new(
        bank.clone(),
        provider.clone(),
        WriterSettings {
            base_url: "http://localhost:1".into(),
            api_key: String::new(),
            model: "mock-model".into(),
            min_chars: 20,
        },
    ));
    let service = chat_service(provider.clone(), &events)
        .with_memory(MemorySources {
            bank: bank.clone(),
            docs: DocsService::new(store.clone()),
            limits: InjectionLimits::default(),
        })
        .with_writer(writer);

    let mut ws = Workspace::new(store, events);
    let tree_id = ws.create_tree("Weather", None).await.unwrap().tree.id.clone();
    let outcome = service
        .send(&mut ws, TurnRequest::new("What should I wear in Porto when I bike to work?"))
        .await
        .unwrap();

    let sent = &provider.step_requests.lock().unwrap()[0].chat.messages;
    assert!(sent.iter().any(|m| m.text_content().contains("The user lives in Porto")));

    outcome.memory_task.expect("turn qualifies for extraction").await.unwrap();
    let hits = bank
        .search(&MemoryQuery::new("bike", 5).with_scope(MemoryScope::User))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    let stored = &hits[0].item;
    assert_eq!(stored.text, "The user commutes by bike");
    assert_eq!(stored.tags, vec!["travel"]);
    assert_eq!(stored.sources[0].tree_id.as_deref(), Some(tree_id.as_str()));
}

// ── E2E: gateway round trip ──────────────────────────────────────────────

#[tokio::test]
async fn e2e_turn_through_gateway_over_sse() {
    let upstream = Arc::new(ScriptedProvider::new(vec![
        tool_call("population", serde_json::json!({"city": "Lisbon"})),
        answer("About 545,000."),
    ]));
    let state = Arc::new(canopy_gateway::GatewayState::new(upstream.clone(), registry()));
    let app = canopy_gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (store, events) = setup().await;
    let remote: Arc<dyn ModelEndpoint> = Arc::new(canopy_providers::RemoteAgentClient::new(format!("http://{addr}")));
    let service = chat_service(remote, &events);
    let mut ws = Workspace::new(store, events);
    ws.create_tree("Remote", None).await.unwrap();

    let outcome = service
        .send(&mut ws, TurnRequest::new("Population of Lisbon?").with_tools(["population"]))
        .await
        .unwrap();

    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.assistant_node.content, "About 545,000.");
    assert_eq!(outcome.assistant_node.metadata.tool_logs[0].status, ToolCallStatus::Success);
    assert_eq!(outcome.assistant_node.metadata.provider_id.as_deref(), Some("remote-agent"));
    assert_eq!(upstream.step_calls(), 2);
}
