/// Change events published by the aggregation state (streamed over SSE at /events)
use crate::store::conversations::{ConversationKey, Message};
use crate::store::nodes::NodeSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A node summary changed
    NodeUpdated { node: NodeSummary },
    /// A text message was appended to a conversation
    MessageRecorded {
        conversation: ConversationKey,
        message: Message,
    },
    /// The local node id became known
    IdentityLearned { node_id: String },
    /// Transport connected or disconnected
    ConnectionChanged { connected: bool },
}

impl MeshEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::NodeUpdated { .. } => "node_updated",
            MeshEvent::MessageRecorded { .. } => "message_recorded",
            MeshEvent::IdentityLearned { .. } => "identity_learned",
            MeshEvent::ConnectionChanged { .. } => "connection_changed",
        }
    }
}
