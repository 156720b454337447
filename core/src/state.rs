/// Aggregation facade: the single lock around every piece of mesh state
///
/// Registry, history, conversations, identity, packet de-dup and the recent-send log are
/// one consistency domain behind a `parking_lot::Mutex`. The lock is never held across an
/// `.await`; events, sink records and transport hand-off happen after it is released.
use crate::config::Config;
use crate::error::{MeshError, Result};
use crate::events::MeshEvent;
use crate::identity::LocalIdentity;
use crate::mesh::classifier::{classify, Classified};
use crate::mesh::packet::{Envelope, PositionFields, TelemetryFields};
use crate::mesh::transport::{OutboundText, TextSender, TransportEvent};
use crate::sink::{FlatRecord, RecordSink};
use crate::store::conversations::{
    ConversationEngine, ConversationKey, ConversationSummary, Message, MessageQuery, NewMessage,
    Recorded,
};
use crate::store::history::{HistoryPoint, HistorySampler, Metric, NodeHistory};
use crate::store::nodes::{NodeRegistry, NodeSummary};
use crate::utils::time::{now_epoch, rfc3339};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to one ingested packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Classified and merged; carries the classification kind
    Applied(&'static str),
    /// Packet id seen before
    Duplicate,
    /// Classified as unknown
    Ignored,
}

/// Liveness snapshot for `/api/health`
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ok: bool,
    pub connected: bool,
    pub my_node_id: Option<String>,
    pub node_count: usize,
    pub conversation_count: usize,
    pub server_time: String,
    pub server_epoch: f64,
}

/// A local text to send and record
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub to: String,
    pub text: String,
    /// Falls back to the configured default
    pub want_ack: Option<bool>,
    pub channel_index: u32,
    /// Conversation the send was made from
    pub thread: Option<ConversationKey>,
}

impl SendRequest {
    pub fn new(to: &str, text: &str) -> Self {
        Self {
            to: to.to_string(),
            text: text.to_string(),
            want_ack: None,
            channel_index: 0,
            thread: None,
        }
    }
}

/// Bounded FIFO set of packet ids
struct SeenPackets {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenPackets {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// `false` when the id was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct RecentSend {
    to: String,
    text: String,
    at: f64,
}

struct StateInner {
    nodes: NodeRegistry,
    history: HistorySampler,
    conversations: ConversationEngine,
    identity: LocalIdentity,
    seen: SeenPackets,
    recent_sends: VecDeque<RecentSend>,
    connected: bool,
    transport: Option<Arc<dyn TextSender>>,
}

/// Side effects collected under the lock, released after it
#[derive(Default)]
struct Effects {
    events: Vec<MeshEvent>,
    records: Vec<FlatRecord>,
}

/// Shared handle to the aggregated mesh state. Cheap to clone.
#[derive(Clone)]
pub struct MeshState {
    inner: Arc<Mutex<StateInner>>,
    sink: Option<Arc<dyn RecordSink>>,
    events: broadcast::Sender<MeshEvent>,
    suppress_secs: f64,
    want_ack: bool,
}

impl MeshState {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                nodes: NodeRegistry::new(),
                history: HistorySampler::new(config.history_maxlen, config.history_sample_secs),
                conversations: ConversationEngine::new(config.max_msgs_per_conv),
                identity: LocalIdentity::new(),
                seen: SeenPackets::new(config.dedup_capacity),
                recent_sends: VecDeque::new(),
                connected: false,
                transport: None,
            })),
            sink: None,
            events,
            suppress_secs: config.recent_send_suppress_secs,
            want_ack: config.want_ack,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Install the send primitive used by `send_text`
    pub fn attach_transport(&self, transport: Arc<dyn TextSender>) {
        self.inner.lock().transport = Some(transport);
    }

    // ─── Ingestion ───────────────────────────────────────────────────────────

    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Packet(raw) => {
                self.ingest_packet(&raw);
            }
            TransportEvent::Connected { local_node_id } => {
                self.set_connected(true, local_node_id.as_deref());
            }
            TransportEvent::Disconnected => self.set_connected(false, None),
        }
    }

    /// Record a connection change. A reported local id goes through the same
    /// first-writer-wins update as inference. State is never reset.
    pub fn set_connected(&self, connected: bool, local_node_id: Option<&str>) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.connected != connected {
                inner.connected = connected;
                effects.events.push(MeshEvent::ConnectionChanged { connected });
            }
            if let Some(id) = local_node_id {
                if inner.identity.set_once(id) {
                    inner.conversations.adopt_identity(id);
                    info!("Local node id reported by transport: {}", id);
                    effects.events.push(MeshEvent::IdentityLearned {
                        node_id: id.to_string(),
                    });
                }
            }
        }
        info!("Transport {}", if connected { "connected" } else { "disconnected" });
        self.release(effects);
    }

    /// Classify and merge one packet at the current time. Never fails.
    pub fn ingest_packet(&self, raw: &Value) -> Ingested {
        self.ingest_packet_at(raw, now_epoch())
    }

    pub fn ingest_packet_at(&self, raw: &Value, now: f64) -> Ingested {
        let (outcome, effects) = {
            let mut guard = self.inner.lock();
            apply_packet(&mut guard, raw, now, self.suppress_secs)
        };
        self.release(effects);
        outcome
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    /// Send `text` to `to` and record it in its conversation.
    pub fn record_outbound_message(&self, to: &str, text: &str) -> Result<Recorded> {
        self.send_text(SendRequest::new(to, text))
    }

    pub fn send_text(&self, request: SendRequest) -> Result<Recorded> {
        self.send_text_at(request, now_epoch())
    }

    /// Validate, hand to the transport, then record. Nothing is recorded when the
    /// transport refuses the text.
    pub fn send_text_at(&self, request: SendRequest, now: f64) -> Result<Recorded> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(MeshError::InvalidRequest("text is required".to_string()));
        }
        let to = request.to.trim();
        if to.is_empty() {
            return Err(MeshError::InvalidRequest("destination is required".to_string()));
        }

        let transport = {
            let inner = self.inner.lock();
            if inner.identity.is_me(to) {
                return Err(MeshError::InvalidRequest(
                    "destination is the local node".to_string(),
                ));
            }
            if inner.connected {
                inner.transport.clone()
            } else {
                None
            }
        }
        .ok_or(MeshError::NotConnected)?;

        transport.send_text(&OutboundText {
            to: to.to_string(),
            text: text.to_string(),
            want_ack: request.want_ack.unwrap_or(self.want_ack),
            channel_index: request.channel_index,
        })?;

        let recorded = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.recent_sends.push_back(RecentSend {
                to: to.to_string(),
                text: text.to_string(),
                at: now,
            });
            prune_recent(&mut inner.recent_sends, now, self.suppress_secs);

            let mut msg = NewMessage::local(inner.identity.node_id(), to, text, now);
            msg.thread_hint = request.thread;
            inner.conversations.record_message(&mut inner.identity, msg)
        };
        debug!("Sent text to {} ({} chars)", to, text.chars().count());

        let record = FlatRecord::new("text_sent", now)
            .with_link(recorded.message.from.as_deref(), Some(to), None, None)
            .with_text(text);
        self.release(Effects {
            events: vec![MeshEvent::MessageRecorded {
                conversation: recorded.key.clone(),
                message: recorded.message.clone(),
            }],
            records: vec![record],
        });
        Ok(recorded)
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    pub fn list_summaries(&self) -> Vec<NodeSummary> {
        self.inner.lock().nodes.list_summaries()
    }

    pub fn get_summary(&self, node_id: &str) -> Option<NodeSummary> {
        self.inner.lock().nodes.get_summary(node_id)
    }

    pub fn get_history(&self, node_id: &str, metric: Metric) -> Vec<HistoryPoint> {
        self.inner.lock().history.get_history(node_id, metric)
    }

    pub fn history_snapshot(&self, limit: Option<usize>) -> BTreeMap<String, NodeHistory> {
        self.inner.lock().history.snapshot(limit)
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        let inner = self.inner.lock();
        inner.conversations.list_conversations(inner.identity.node_id())
    }

    pub fn get_messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.inner.lock().conversations.get_messages(key)
    }

    pub fn query_messages(&self, key: &ConversationKey, query: &MessageQuery) -> Vec<Message> {
        self.inner.lock().conversations.query_messages(key, query)
    }

    pub fn resolve_reply_target(&self, key: &ConversationKey) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .conversations
            .resolve_reply_target(key, inner.identity.node_id())
    }

    pub fn my_node_id(&self) -> Option<String> {
        self.inner.lock().identity.node_id().map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn health(&self) -> Health {
        let now = now_epoch();
        let inner = self.inner.lock();
        Health {
            ok: true,
            connected: inner.connected,
            my_node_id: inner.identity.node_id().map(str::to_string),
            node_count: inner.nodes.len(),
            conversation_count: inner.conversations.len(),
            server_time: rfc3339(now),
            server_epoch: now,
        }
    }

    fn release(&self, effects: Effects) {
        if let Some(sink) = &self.sink {
            for record in &effects.records {
                sink.record(record);
            }
        }
        for event in effects.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

fn apply_packet(inner: &mut StateInner, raw: &Value, now: f64, suppress_secs: f64) -> (Ingested, Effects) {
    let mut effects = Effects::default();
    let env = Envelope::from_value(raw);

    if let Some(id) = env.packet_id.as_deref() {
        if !inner.seen.insert(id) {
            debug!("Duplicate packet {}", id);
            return (Ingested::Duplicate, effects);
        }
    }

    let classified = classify(raw);
    let kind = classified.kind();
    let node_id = match &classified {
        Classified::Telemetry { node_id, .. }
        | Classified::Position { node_id, .. }
        | Classified::NodeInfo { node_id, .. } => node_id.clone(),
        Classified::Text { from, .. } => from.clone(),
        Classified::Unknown { .. } => {
            debug!("Ignoring packet (portnum={:?})", env.portnum);
            return (Ingested::Ignored, effects);
        }
    };
    debug!("{} from {}", classified, node_id);

    inner.nodes.note_link(&node_id, env.to.as_deref(), env.rssi, env.snr);
    if let Some(rssi) = env.rssi {
        inner.history.record_sample(&node_id, Metric::Rssi, rssi, now);
    }
    if let Some(snr) = env.snr {
        inner.history.record_sample(&node_id, Metric::Snr, snr, now);
    }

    let record = FlatRecord::new(env.portnum.as_deref().unwrap_or(kind), now).with_link(
        Some(&node_id),
        env.to.as_deref(),
        env.rssi,
        env.snr,
    );

    match classified {
        Classified::Telemetry { node_id, fields } => {
            inner.nodes.merge_telemetry(&node_id, &fields, now);
            sample_telemetry(&mut inner.history, &node_id, &fields, now);
            effects.records.push(record.with_telemetry(&fields));
        }
        Classified::Position { node_id, lat, lon, alt } => {
            let position = PositionFields {
                latitude: lat,
                longitude: lon,
                altitude: alt,
            };
            inner.nodes.merge_position(&node_id, &position, now);
            effects.records.push(record.with_position(&position));
        }
        Classified::NodeInfo {
            node_id,
            long_name,
            short_name,
        } => {
            inner
                .nodes
                .upsert_node_info(&node_id, long_name.as_deref(), short_name.as_deref(), now);
        }
        Classified::Text { from, to, text } => {
            inner.nodes.note_text(&from, &text, now);

            prune_recent(&mut inner.recent_sends, now, suppress_secs);
            let echo = inner.identity.is_me(&from)
                && inner
                    .recent_sends
                    .iter()
                    .any(|s| s.to == to && s.text == text);

            if echo {
                debug!("Suppressing echo of our own message to {}", to);
            } else {
                let mut msg = NewMessage::from_packet(&from, &to, &text, now);
                msg.rssi = env.rssi;
                msg.snr = env.snr;
                let recorded = inner.conversations.record_message(&mut inner.identity, msg);
                if let Some(me) = recorded.inferred_identity.clone() {
                    info!("Inferred local node id {} from directed message", me);
                    effects.events.push(MeshEvent::IdentityLearned { node_id: me });
                }
                effects.events.push(MeshEvent::MessageRecorded {
                    conversation: recorded.key,
                    message: recorded.message,
                });
                effects.records.push(record.with_text(&text));
            }
        }
        Classified::Unknown { .. } => {}
    }

    if let Some(node) = inner.nodes.get_summary(&node_id) {
        effects.events.insert(0, MeshEvent::NodeUpdated { node });
    }
    (Ingested::Applied(kind), effects)
}

fn sample_telemetry(history: &mut HistorySampler, node_id: &str, fields: &TelemetryFields, now: f64) {
    let samples = [
        (Metric::Battery, fields.battery_level),
        (Metric::Voltage, fields.voltage),
        (Metric::Temperature, fields.temperature_c),
        (Metric::Humidity, fields.relative_humidity),
        (Metric::Pressure, fields.pressure_hpa),
    ];
    for (metric, value) in samples {
        if let Some(v) = value {
            history.record_sample(node_id, metric, v, now);
        }
    }
}

fn prune_recent(recent: &mut VecDeque<RecentSend>, now: f64, window: f64) {
    while recent.front().map(|s| now - s.at > window).unwrap_or(false) {
        recent.pop_front();
    }
}
