/// Conversation threads keyed by participant pair, plus reply-target resolution
use crate::identity::LocalIdentity;
use crate::mesh::packet::BROADCAST_ADDR;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

const PAIR_PREFIX: &str = "pair:";
const PENDING_PREFIX: &str = "pending:";
const PREVIEW_CHARS: usize = 80;

/// Thread identity: the broadcast channel, an unordered pair of distinct node ids, or a
/// thread with a peer opened by local sends before the local node id was known.
///
/// Text form is `^all`, `pair:A|B` with `A < B`, or `pending:P`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    Broadcast,
    Pair(String, String),
    /// Folded into `Pair(me, P)` once the local node id is learned
    Pending(String),
}

impl ConversationKey {
    /// Same key for (a, b) and (b, a)
    pub fn canonical(a: &str, b: &str) -> Self {
        if a <= b {
            ConversationKey::Pair(a.to_string(), b.to_string())
        } else {
            ConversationKey::Pair(b.to_string(), a.to_string())
        }
    }

    pub fn participants(&self) -> Option<(&str, &str)> {
        match self {
            ConversationKey::Pair(a, b) => Some((a, b)),
            ConversationKey::Broadcast | ConversationKey::Pending(_) => None,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        match self {
            ConversationKey::Broadcast => false,
            ConversationKey::Pair(a, b) => a == node_id || b == node_id,
            ConversationKey::Pending(peer) => peer == node_id,
        }
    }
}

/// Canonical key for a message between `a` and `b`.
pub fn canonical_key(a: &str, b: &str) -> ConversationKey {
    ConversationKey::canonical(a, b)
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Broadcast => f.write_str(BROADCAST_ADDR),
            ConversationKey::Pair(a, b) => write!(f, "{}{}|{}", PAIR_PREFIX, a, b),
            ConversationKey::Pending(peer) => write!(f, "{}{}", PENDING_PREFIX, peer),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BROADCAST_ADDR {
            return Ok(ConversationKey::Broadcast);
        }
        if let Some(peer) = s.strip_prefix(PENDING_PREFIX) {
            if !peer.is_empty() && peer != BROADCAST_ADDR {
                return Ok(ConversationKey::Pending(peer.to_string()));
            }
            return Err(format!("invalid conversation id: {}", s));
        }
        let body = s
            .strip_prefix(PAIR_PREFIX)
            .ok_or_else(|| format!("invalid conversation id: {}", s))?;
        match body.split_once('|') {
            Some((a, b)) if !a.is_empty() && !b.is_empty() && a != b => {
                Ok(ConversationKey::canonical(a, b))
            }
            _ => Err(format!("invalid conversation id: {}", s)),
        }
    }
}

impl Serialize for ConversationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConversationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    InboundBroadcast,
    OutboundBroadcast,
    /// Directed message seen before the local identity was known
    Unknown,
}

/// Where a message entered the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Heard on the radio
    Packet,
    /// Submitted locally for sending
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `None` for local sends made before the local identity was known
    pub from: Option<String>,
    pub to: String,
    pub text: String,
    pub direction: Direction,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
}

/// A message about to be recorded
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: Option<String>,
    pub to: String,
    pub text: String,
    pub timestamp: f64,
    pub origin: Origin,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    /// Thread a local send was made from. Only consulted while the local identity is
    /// unknown, so the reply lands in the thread it answers.
    pub thread_hint: Option<ConversationKey>,
}

impl NewMessage {
    pub fn from_packet(from: &str, to: &str, text: &str, timestamp: f64) -> Self {
        Self {
            from: Some(from.to_string()),
            to: to.to_string(),
            text: text.to_string(),
            timestamp,
            origin: Origin::Packet,
            rssi: None,
            snr: None,
            thread_hint: None,
        }
    }

    pub fn local(from: Option<&str>, to: &str, text: &str, timestamp: f64) -> Self {
        Self {
            from: from.map(str::to_string),
            to: to.to_string(),
            text: text.to_string(),
            timestamp,
            origin: Origin::Local,
            rssi: None,
            snr: None,
            thread_hint: None,
        }
    }
}

/// What `record_message` did
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub key: ConversationKey,
    pub message: Message,
    /// Set when this message taught us the local node id
    pub inferred_identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub last_message_at: f64,
    pub message_count: usize,
    pub last_preview: String,
    /// The other party when the local node is a participant
    pub peer: Option<String>,
}

/// Filters for reading a thread
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageQuery {
    /// Only messages strictly newer than this
    pub since: Option<f64>,
    /// Keep only the newest N
    pub limit: Option<usize>,
    /// For pair and pending threads, merge in broadcasts sent by a participant
    pub include_broadcast: bool,
}

#[derive(Debug)]
struct Conversation {
    messages: VecDeque<Message>,
    last_message_at: f64,
}

pub struct ConversationEngine {
    max_msgs: usize,
    threads: HashMap<ConversationKey, Conversation>,
}

impl ConversationEngine {
    /// `max_msgs` is clamped to at least one message.
    pub fn new(max_msgs: usize) -> Self {
        Self {
            max_msgs: max_msgs.max(1),
            threads: HashMap::new(),
        }
    }

    /// Append a message to its thread, creating the thread if needed.
    ///
    /// A directed message heard on the radio while the local identity is unknown sets it
    /// to the message's destination, and pending threads are folded into their pairs.
    pub fn record_message(&mut self, identity: &mut LocalIdentity, msg: NewMessage) -> Recorded {
        let broadcast = msg.to == BROADCAST_ADDR;
        let from_me = match (&msg.from, identity.node_id()) {
            (Some(from), Some(me)) => from == me,
            _ => false,
        };

        let key = if broadcast {
            ConversationKey::Broadcast
        } else {
            match msg.from.as_deref() {
                Some(from) => canonical_key(from, &msg.to),
                None => match msg.thread_hint {
                    Some(hint) if hint.contains(&msg.to) => hint,
                    _ => ConversationKey::Pending(msg.to.clone()),
                },
            }
        };

        let direction = match (msg.origin, broadcast) {
            (Origin::Local, true) => Direction::OutboundBroadcast,
            (Origin::Local, false) => Direction::Outbound,
            (Origin::Packet, true) if from_me => Direction::OutboundBroadcast,
            (Origin::Packet, true) => Direction::InboundBroadcast,
            (Origin::Packet, false) if !identity.is_known() => Direction::Unknown,
            (Origin::Packet, false) if from_me => Direction::Outbound,
            (Origin::Packet, false) => Direction::Inbound,
        };

        let message = Message {
            from: msg.from,
            to: msg.to,
            text: msg.text,
            direction,
            timestamp: msg.timestamp,
            rssi: msg.rssi,
            snr: msg.snr,
        };

        let thread = self
            .threads
            .entry(key.clone())
            .or_insert_with(|| Conversation {
                messages: VecDeque::new(),
                last_message_at: message.timestamp,
            });
        if thread.messages.len() == self.max_msgs {
            thread.messages.pop_front();
        }
        thread.messages.push_back(message.clone());
        thread.last_message_at = message.timestamp;

        let inferred_identity = if msg.origin == Origin::Packet && !broadcast && identity.set_once(&message.to) {
            self.adopt_identity(&message.to);
            Some(message.to.clone())
        } else {
            None
        };

        Recorded {
            key,
            message,
            inferred_identity,
        }
    }

    /// Move every `Pending(peer)` thread into `canonical_key(me, peer)`, merging by
    /// timestamp and keeping the newest `max_msgs`. Call once the local id is known.
    pub fn adopt_identity(&mut self, me: &str) {
        let max_msgs = self.max_msgs;
        let peers: Vec<String> = self
            .threads
            .keys()
            .filter_map(|k| match k {
                ConversationKey::Pending(peer) if peer != me => Some(peer.clone()),
                _ => None,
            })
            .collect();

        for peer in peers {
            let Some(pending) = self.threads.remove(&ConversationKey::Pending(peer.clone())) else {
                continue;
            };
            let thread = self
                .threads
                .entry(canonical_key(me, &peer))
                .or_insert_with(|| Conversation {
                    messages: VecDeque::new(),
                    last_message_at: pending.last_message_at,
                });

            let mut merged: Vec<Message> = thread.messages.drain(..).chain(pending.messages).collect();
            merged.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal));
            let excess = merged.len().saturating_sub(max_msgs);
            thread.messages = merged.into_iter().skip(excess).collect();
            thread.last_message_at = thread.last_message_at.max(pending.last_message_at);
        }
    }

    /// Who a reply typed into `key` should go to.
    ///
    /// Broadcast replies go to `^all` and pending threads to their peer. When the local
    /// node is one side of the pair the other side is returned; otherwise the sender of
    /// the latest message is.
    pub fn resolve_reply_target(&self, key: &ConversationKey, my_id: Option<&str>) -> Option<String> {
        let (a, b) = match key {
            ConversationKey::Broadcast => return Some(BROADCAST_ADDR.to_string()),
            ConversationKey::Pending(peer) => return Some(peer.clone()),
            ConversationKey::Pair(a, b) => (a.as_str(), b.as_str()),
        };

        if let Some(me) = my_id {
            if me == a {
                return Some(b.to_string());
            }
            if me == b {
                return Some(a.to_string());
            }
        }

        let last = self.threads.get(key)?.messages.back()?;
        match &last.from {
            Some(from) => Some(from.clone()),
            None if last.to != BROADCAST_ADDR => Some(last.to.clone()),
            None => None,
        }
    }

    /// Newest activity first
    pub fn list_conversations(&self, my_id: Option<&str>) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .threads
            .iter()
            .map(|(key, thread)| ConversationSummary {
                key: key.clone(),
                last_message_at: thread.last_message_at,
                message_count: thread.messages.len(),
                last_preview: thread
                    .messages
                    .back()
                    .map(|m| m.text.chars().take(PREVIEW_CHARS).collect())
                    .unwrap_or_default(),
                peer: peer_of(key, my_id),
            })
            .collect();
        out.sort_by(|a, b| {
            b.last_message_at
                .partial_cmp(&a.last_message_at)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
        });
        out
    }

    /// Oldest first
    pub fn get_messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.threads
            .get(key)
            .map(|t| t.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn query_messages(&self, key: &ConversationKey, query: &MessageQuery) -> Vec<Message> {
        let mut out = self.get_messages(key);

        if query.include_broadcast {
            let bcast = match key {
                ConversationKey::Broadcast => None,
                _ => self.threads.get(&ConversationKey::Broadcast),
            };
            if let Some(bcast) = bcast {
                out.extend(
                    bcast
                        .messages
                        .iter()
                        .filter(|m| m.from.as_deref().map(|f| key.contains(f)).unwrap_or(false))
                        .cloned(),
                );
                out.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal));
            }
        }

        if let Some(since) = query.since {
            out.retain(|m| m.timestamp > since);
        }
        if let Some(limit) = query.limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

fn peer_of(key: &ConversationKey, my_id: Option<&str>) -> Option<String> {
    if let ConversationKey::Pending(peer) = key {
        return Some(peer.clone());
    }
    let (a, b) = key.participants()?;
    let me = my_id?;
    if me == a {
        Some(b.to_string())
    } else if me == b {
        Some(a.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(engine: &mut ConversationEngine, id: &mut LocalIdentity, from: &str, to: &str, text: &str, ts: f64) -> Recorded {
        engine.record_message(id, NewMessage::from_packet(from, to, text, ts))
    }

    #[test]
    fn test_canonical_key_is_order_independent() {
        for (a, b) in [("10", "20"), ("!ffff", "!0001"), ("x", "y")] {
            assert_eq!(canonical_key(a, b), canonical_key(b, a));
        }
        assert_eq!(canonical_key("20", "10").to_string(), "pair:10|20");
    }

    #[test]
    fn test_key_parse() {
        assert_eq!("^all".parse::<ConversationKey>().unwrap(), ConversationKey::Broadcast);
        assert_eq!(
            "pair:b|a".parse::<ConversationKey>().unwrap(),
            canonical_key("a", "b")
        );
        assert!("pair:a".parse::<ConversationKey>().is_err());
        assert!("pair:a|a".parse::<ConversationKey>().is_err());
        assert_eq!(
            "pending:!20".parse::<ConversationKey>().unwrap(),
            ConversationKey::Pending("!20".to_string())
        );
        assert!("pending:".parse::<ConversationKey>().is_err());
        assert!("dm:a:b".parse::<ConversationKey>().is_err());
    }

    #[test]
    fn test_identity_inference_and_reply_target() {
        let mut engine = ConversationEngine::new(100);
        let mut id = LocalIdentity::new();

        let first = record(&mut engine, &mut id, "20", "10", "hi", 5.0);
        assert_eq!(first.inferred_identity.as_deref(), Some("10"));
        assert_eq!(first.message.direction, Direction::Unknown);
        assert_eq!(id.node_id(), Some("10"));

        let second = record(&mut engine, &mut id, "10", "20", "hello", 6.0);
        assert_eq!(second.inferred_identity, None);
        assert_eq!(second.message.direction, Direction::Outbound);
        assert_eq!(id.node_id(), Some("10"));

        let key = canonical_key("10", "20");
        assert_eq!(first.key, key);
        assert_eq!(engine.resolve_reply_target(&key, id.node_id()).as_deref(), Some("20"));
        assert_eq!(engine.get_messages(&key).len(), 2);
    }

    #[test]
    fn test_identity_is_stable() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        record(&mut engine, &mut id, "1", "2", "a", 1.0);
        for (from, to) in [("3", "4"), ("2", "5"), ("6", "1")] {
            record(&mut engine, &mut id, from, to, "x", 2.0);
            assert_eq!(id.node_id(), Some("2"));
        }
    }

    #[test]
    fn test_broadcast_goes_to_single_thread() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        let r = record(&mut engine, &mut id, "10", BROADCAST_ADDR, "status", 1.0);

        assert_eq!(r.key, ConversationKey::Broadcast);
        assert_eq!(r.message.direction, Direction::InboundBroadcast);
        assert_eq!(r.inferred_identity, None);
        assert!(!id.is_known());
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get_messages(&ConversationKey::Broadcast).len(), 1);
        assert_eq!(
            engine.resolve_reply_target(&ConversationKey::Broadcast, None).as_deref(),
            Some(BROADCAST_ADDR)
        );
    }

    #[test]
    fn test_own_broadcast_is_outbound() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        id.set_once("10");
        let r = record(&mut engine, &mut id, "10", BROADCAST_ADDR, "ping", 1.0);
        assert_eq!(r.message.direction, Direction::OutboundBroadcast);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut engine = ConversationEngine::new(3);
        let mut id = LocalIdentity::new();
        for i in 0..5 {
            record(&mut engine, &mut id, "a", "b", &format!("m{}", i), i as f64);
        }
        let texts: Vec<String> = engine
            .get_messages(&canonical_key("a", "b"))
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_last_sender_fallback() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        id.set_once("99");
        record(&mut engine, &mut id, "a", "b", "one", 1.0);
        record(&mut engine, &mut id, "b", "a", "two", 2.0);

        let key = canonical_key("a", "b");
        // Foreign thread: the local node is not a participant.
        assert_eq!(engine.resolve_reply_target(&key, id.node_id()).as_deref(), Some("b"));
        // Identity unknown behaves the same.
        assert_eq!(engine.resolve_reply_target(&key, None).as_deref(), Some("b"));
        // Nothing to go on.
        assert_eq!(engine.resolve_reply_target(&canonical_key("x", "y"), None), None);
    }

    #[test]
    fn test_local_send_does_not_infer_identity() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        let r = engine.record_message(&mut id, NewMessage::local(None, "20", "yo", 1.0));
        assert_eq!(r.inferred_identity, None);
        assert!(!id.is_known());
        assert_eq!(r.message.direction, Direction::Outbound);
        assert_eq!(r.key, ConversationKey::Pending("20".to_string()));
        assert_eq!(engine.resolve_reply_target(&r.key, None).as_deref(), Some("20"));
    }

    #[test]
    fn test_local_send_uses_thread_hint() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        let key = canonical_key("a", "b");
        let mut msg = NewMessage::local(None, "a", "reply", 1.0);
        msg.thread_hint = Some(key.clone());
        assert_eq!(engine.record_message(&mut id, msg).key, key);

        let mut stray = NewMessage::local(None, "c", "other", 2.0);
        stray.thread_hint = Some(key.clone());
        assert_eq!(engine.record_message(&mut id, stray).key, ConversationKey::Pending("c".to_string()));
    }

    #[test]
    fn test_pending_thread_folds_into_pair_on_inference() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        let sent = engine.record_message(&mut id, NewMessage::local(None, "!20", "hello?", 1.0));
        assert_eq!(sent.key.to_string(), "pending:!20");

        let reply = record(&mut engine, &mut id, "!20", "!10", "hi back", 2.0);
        assert_eq!(reply.inferred_identity.as_deref(), Some("!10"));

        let list = engine.list_conversations(id.node_id());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key, canonical_key("!10", "!20"));
        assert_eq!(list[0].message_count, 2);
        assert_eq!(list[0].peer.as_deref(), Some("!20"));

        let texts: Vec<String> = engine
            .get_messages(&canonical_key("!10", "!20"))
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["hello?", "hi back"]);
    }

    #[test]
    fn test_adopt_identity_interleaves_and_caps() {
        let mut engine = ConversationEngine::new(3);
        let mut id = LocalIdentity::new();
        record(&mut engine, &mut id, "!30", "!20", "in-2", 2.0);
        for (text, ts) in [("out-1", 1.0), ("out-3", 3.0), ("out-4", 4.0)] {
            engine.record_message(&mut id, NewMessage::local(None, "!30", text, ts));
        }
        // Sends recorded without a sender stay pending until adopted.
        engine.adopt_identity("!20");

        let texts: Vec<String> = engine
            .get_messages(&canonical_key("!20", "!30"))
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["in-2", "out-3", "out-4"]);
        assert_eq!(engine.len(), 1);
        assert!(engine.get_messages(&ConversationKey::Pending("!30".to_string())).is_empty());
    }

    #[test]
    fn test_list_orders_by_last_message() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        record(&mut engine, &mut id, "1", "2", "early", 1.0);
        record(&mut engine, &mut id, "3", BROADCAST_ADDR, "mid", 2.0);
        record(&mut engine, &mut id, "2", "4", "late", 3.0);

        let list = engine.list_conversations(id.node_id());
        let keys: Vec<String> = list.iter().map(|c| c.key.to_string()).collect();
        assert_eq!(keys, vec!["pair:2|4", "^all", "pair:1|2"]);
        assert_eq!(list[0].last_preview, "late");
        // Identity was inferred as "2" from the first message.
        assert_eq!(list[0].peer.as_deref(), Some("4"));
        assert_eq!(list[1].peer, None);
    }

    #[test]
    fn test_query_merges_participant_broadcasts() {
        let mut engine = ConversationEngine::new(10);
        let mut id = LocalIdentity::new();
        record(&mut engine, &mut id, "a", "b", "dm1", 1.0);
        record(&mut engine, &mut id, "a", BROADCAST_ADDR, "bc-a", 2.0);
        record(&mut engine, &mut id, "z", BROADCAST_ADDR, "bc-z", 3.0);
        record(&mut engine, &mut id, "b", "a", "dm2", 4.0);

        let key = canonical_key("a", "b");
        let all = engine.query_messages(
            &key,
            &MessageQuery {
                include_broadcast: true,
                ..Default::default()
            },
        );
        let texts: Vec<&str> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["dm1", "bc-a", "dm2"]);

        let recent = engine.query_messages(
            &key,
            &MessageQuery {
                since: Some(1.0),
                limit: Some(1),
                include_broadcast: true,
            },
        );
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].text, "dm2");
    }

    #[test]
    fn test_key_serializes_as_text() {
        let json = serde_json::to_string(&canonical_key("b", "a")).unwrap();
        assert_eq!(json, "\"pair:a|b\"");
        let back: ConversationKey = serde_json::from_str("\"^all\"").unwrap();
        assert_eq!(back, ConversationKey::Broadcast);
    }
}
