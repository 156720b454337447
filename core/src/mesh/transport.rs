/// Seam between the aggregation state and whatever delivers packets
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;

/// What a transport reports to the ingest task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One decoded packet
    Packet(Value),
    /// Link is up; some transports know the local node id at this point
    Connected { local_node_id: Option<String> },
    Disconnected,
}

/// A text to put on the air
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundText {
    pub to: String,
    pub text: String,
    pub want_ack: bool,
    pub channel_index: u32,
}

/// Send primitive of a connected transport. Must not block.
pub trait TextSender: Send + Sync {
    fn send_text(&self, text: &OutboundText) -> Result<()>;
}
