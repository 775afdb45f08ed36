//! Domain event system: change notification for the workspace state.
//!
//! Every mutation of durable state publishes an event after it has been
//! committed. Observers (UI layers, the memory writer, tests) subscribe and
//! filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    NodeCreated {
        tree_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    NodeUpdated {
        tree_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A subtree was removed. `node_ids` lists every deleted node.
    NodesDeleted {
        tree_id: String,
        node_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    TreeCreated {
        tree_id: String,
        folder_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    TreeUpdated {
        tree_id: String,
        timestamp: DateTime<Utc>,
    },

    TreeDeleted {
        tree_id: String,
        timestamp: DateTime<Utc>,
    },

    FolderChanged {
        folder_id: String,
        timestamp: DateTime<Utc>,
    },

    FolderDeleted {
        folder_id: String,
        detached_tree_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    ContextBoxChanged {
        tree_id: String,
        total_tokens: usize,
        max_tokens: usize,
        timestamp: DateTime<Utc>,
    },

    ActiveNodeChanged {
        tree_id: String,
        node_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    SelectionChanged {
        tree_id: String,
        node_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// An agent turn finished and its assistant node was persisted.
    TurnCompleted {
        tree_id: String,
        user_node_id: String,
        assistant_node_id: String,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    MemoryUpserted {
        memory_id: String,
        timestamp: DateTime<Utc>,
    },

    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            tool_name: "web_search".into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "web_search");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::TreeDeleted {
            tree_id: "t".into(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = DomainEvent::ActiveNodeChanged {
            tree_id: "t".into(),
            node_id: Some("n".into()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "active_node_changed");
    }
}
