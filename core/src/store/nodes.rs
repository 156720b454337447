/// Node registry: one live summary record per node heard on the mesh
use crate::mesh::packet::{PositionFields, TelemetryFields};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

const TEXT_PREVIEW_CHARS: usize = 120;

/// Aggregated view of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    /// Epoch seconds of the latest merge
    pub last_updated: Option<f64>,
    #[serde(flatten)]
    pub telemetry: TelemetryFields,
    /// Derived from `temperature_c` on every merge
    pub temperature_f: Option<f64>,
    #[serde(flatten)]
    pub position: PositionFields,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    /// Destination of the last packet this node sent
    pub last_to: Option<String>,
    /// Preview of the last text this node sent
    pub last_text: Option<String>,
}

impl NodeSummary {
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            long_name: None,
            short_name: None,
            last_updated: None,
            telemetry: TelemetryFields::default(),
            temperature_f: None,
            position: PositionFields::default(),
            rssi: None,
            snr: None,
            last_to: None,
            last_text: None,
        }
    }

    fn touch(&mut self, timestamp: f64) {
        self.last_updated = Some(match self.last_updated {
            Some(current) if current > timestamp => current,
            _ => timestamp,
        });
    }
}

/// Owns every `NodeSummary`. Records are never removed.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeSummary>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeSummary {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeSummary::new(node_id.to_string()))
    }

    /// Set the provided names; absent names keep their previous value.
    pub fn upsert_node_info(
        &mut self,
        node_id: &str,
        long_name: Option<&str>,
        short_name: Option<&str>,
        now: f64,
    ) -> &NodeSummary {
        let node = self.entry(node_id);
        if let Some(name) = long_name {
            node.long_name = Some(name.to_string());
        }
        if let Some(name) = short_name {
            node.short_name = Some(name.to_string());
        }
        node.touch(now);
        node
    }

    pub fn merge_telemetry(
        &mut self,
        node_id: &str,
        fields: &TelemetryFields,
        timestamp: f64,
    ) -> &NodeSummary {
        let node = self.entry(node_id);
        node.telemetry.merge_from(fields);
        if fields.temperature_c.is_some() {
            node.temperature_f = node.telemetry.temperature_f();
        }
        node.touch(timestamp);
        node
    }

    pub fn merge_position(
        &mut self,
        node_id: &str,
        position: &PositionFields,
        timestamp: f64,
    ) -> &NodeSummary {
        let node = self.entry(node_id);
        node.position.merge_from(position);
        node.touch(timestamp);
        node
    }

    /// Record link quality and destination of a packet; does not count as activity.
    pub fn note_link(
        &mut self,
        node_id: &str,
        to: Option<&str>,
        rssi: Option<f64>,
        snr: Option<f64>,
    ) {
        let node = self.entry(node_id);
        if let Some(to) = to {
            node.last_to = Some(to.to_string());
        }
        if rssi.is_some() {
            node.rssi = rssi;
        }
        if snr.is_some() {
            node.snr = snr;
        }
    }

    pub fn note_text(&mut self, node_id: &str, text: &str, timestamp: f64) -> &NodeSummary {
        let node = self.entry(node_id);
        node.last_text = Some(text.chars().take(TEXT_PREVIEW_CHARS).collect());
        node.touch(timestamp);
        node
    }

    pub fn get_summary(&self, node_id: &str) -> Option<NodeSummary> {
        self.nodes.get(node_id).cloned()
    }

    /// Most recently updated first; never-updated nodes last.
    pub fn list_summaries(&self) -> Vec<NodeSummary> {
        let mut out: Vec<NodeSummary> = self.nodes.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_updated
                .partial_cmp(&a.last_updated)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
