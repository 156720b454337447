/// End-to-end aggregation scenarios through the shared state
extern crate meshdash_core;

use meshdash_core::mesh::packet::BROADCAST_ADDR;
use meshdash_core::mesh::transport::{OutboundText, TextSender};
use meshdash_core::sink::{FlatRecord, RecordSink};
use meshdash_core::state::Ingested;
use meshdash_core::store::conversations::{canonical_key, ConversationKey, Direction};
use meshdash_core::store::history::Metric;
use meshdash_core::{Config, MeshState, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Default)]
struct MemorySink {
    rows: Mutex<Vec<FlatRecord>>,
}

impl RecordSink for MemorySink {
    fn record(&self, record: &FlatRecord) {
        self.rows.lock().unwrap().push(record.clone());
    }
}

struct NullSender;

impl TextSender for NullSender {
    fn send_text(&self, _text: &OutboundText) -> Result<()> {
        Ok(())
    }
}

fn text(from: &str, to: &str, body: &str) -> Value {
    json!({"fromId": from, "toId": to, "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": body}})
}

fn telemetry(from: &str, battery: f64) -> Value {
    json!({
        "fromId": from,
        "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {"deviceMetrics": {"batteryLevel": battery}}}
    })
}

#[test]
fn test_nodeinfo_then_telemetry() {
    let state = MeshState::new(&Config::default());
    state.ingest_packet_at(
        &json!({"fromId": "10", "decoded": {"portnum": "NODEINFO_APP", "user": {"longName": "Base", "shortName": "BS"}}}),
        99.0,
    );
    state.ingest_packet_at(&telemetry("10", 80.0), 100.0);

    let node = state.get_summary("10").unwrap();
    assert_eq!(node.long_name.as_deref(), Some("Base"));
    assert_eq!(node.telemetry.battery_level, Some(80.0));
    assert_eq!(node.last_updated, Some(100.0));

    let battery = state.get_history("10", Metric::Battery);
    assert_eq!(battery.len(), 1);
    assert_eq!(battery[0].t, 100.0);
    assert_eq!(battery[0].value, 80.0);
}

#[test]
fn test_identity_inference_then_reply() {
    let state = MeshState::new(&Config::default());
    state.ingest_packet_at(&text("20", "10", "hi"), 1.0);
    assert_eq!(state.my_node_id().as_deref(), Some("10"));

    state.ingest_packet_at(&text("10", "20", "hello back"), 2.0);
    assert_eq!(state.my_node_id().as_deref(), Some("10"));

    let key = canonical_key("10", "20");
    assert_eq!(state.resolve_reply_target(&key).as_deref(), Some("20"));

    let msgs = state.get_messages(&key);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].direction, Direction::Unknown);
    assert_eq!(msgs[1].direction, Direction::Outbound);
}

#[test]
fn test_history_capacity_three() {
    let config = Config {
        history_maxlen: 3,
        history_sample_secs: 2.0,
        ..Default::default()
    };
    let state = MeshState::new(&config);
    for t in [0.0, 3.0, 6.0, 9.0] {
        state.ingest_packet_at(&telemetry("n", t), t);
    }
    let times: Vec<f64> = state
        .get_history("n", Metric::Battery)
        .iter()
        .map(|p| p.t)
        .collect();
    assert_eq!(times, vec![3.0, 6.0, 9.0]);
}

#[test]
fn test_broadcast_only_in_broadcast_thread() {
    let state = MeshState::new(&Config::default());
    state.ingest_packet_at(&text("10", BROADCAST_ADDR, "status"), 1.0);

    let convs = state.list_conversations();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].key, ConversationKey::Broadcast);
    assert_eq!(state.get_messages(&ConversationKey::Broadcast).len(), 1);
    assert_eq!(state.my_node_id(), None);
}

#[test]
fn test_conversation_overflow_keeps_newest() {
    let config = Config {
        max_msgs_per_conv: 5,
        ..Default::default()
    };
    let state = MeshState::new(&config);
    for i in 0..12 {
        state.ingest_packet_at(&text("a", "b", &format!("m{}", i)), i as f64);
    }
    let msgs = state.get_messages(&canonical_key("a", "b"));
    assert_eq!(msgs.len(), 5);
    assert_eq!(msgs[0].text, "m7");
    assert_eq!(msgs[4].text, "m11");
}

#[test]
fn test_malformed_packets_are_harmless() {
    let state = MeshState::new(&Config::default());
    for raw in [
        json!(null),
        json!("text"),
        json!({"decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "no sender"}}),
        json!({"fromId": "x", "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {}}}),
    ] {
        assert_eq!(state.ingest_packet_at(&raw, 1.0), Ingested::Ignored);
    }
    assert!(state.list_summaries().is_empty());
    assert!(state.list_conversations().is_empty());
}

#[test]
fn test_sink_sees_merges_and_messages() {
    let sink = Arc::new(MemorySink::default());
    let state = MeshState::new(&Config::default()).with_sink(sink.clone());
    state.attach_transport(Arc::new(NullSender));
    state.set_connected(true, Some("!me"));

    state.ingest_packet_at(&telemetry("!a", 50.0), 1.0);
    state.ingest_packet_at(
        &json!({"fromId": "!a", "decoded": {"portnum": "POSITION_APP", "position": {"latitude": 1.0, "longitude": 2.0}}}),
        2.0,
    );
    state.ingest_packet_at(
        &json!({"fromId": "!a", "decoded": {"portnum": "NODEINFO_APP", "user": {"shortName": "A"}}}),
        3.0,
    );
    state.ingest_packet_at(&text("!a", "!me", "yo"), 4.0);
    state.record_outbound_message("!a", "back").unwrap();

    let rows = sink.rows.lock().unwrap();
    let events: Vec<&str> = rows.iter().map(|r| r.event.as_str()).collect();
    assert_eq!(
        events,
        vec!["TELEMETRY_APP", "POSITION_APP", "TEXT_MESSAGE_APP", "text_sent"]
    );
    assert_eq!(rows[0].battery, Some(50.0));
    assert_eq!(rows[1].lat, Some(1.0));
    assert_eq!(rows[2].text.as_deref(), Some("yo"));
    assert_eq!(rows[3].from.as_deref(), Some("!me"));
}

#[test]
fn test_outbound_before_identity_has_no_sender() {
    let state = MeshState::new(&Config::default());
    state.attach_transport(Arc::new(NullSender));
    state.set_connected(true, None);

    let recorded = state.record_outbound_message("!20", "first").unwrap();
    assert_eq!(recorded.message.from, None);
    assert_eq!(recorded.message.direction, Direction::Outbound);
    assert_eq!(state.my_node_id(), None);
    assert_eq!(state.resolve_reply_target(&recorded.key).as_deref(), Some("!20"));
}

#[test]
fn test_early_send_and_reply_share_one_thread() {
    let state = MeshState::new(&Config::default());
    state.attach_transport(Arc::new(NullSender));
    state.set_connected(true, None);

    state.record_outbound_message("!20", "hello?").unwrap();
    state.ingest_packet_at(&text("!20", "!10", "hi back"), 1e12);
    assert_eq!(state.my_node_id().as_deref(), Some("!10"));

    let convs = state.list_conversations();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].key, canonical_key("!10", "!20"));
    assert_eq!(convs[0].message_count, 2);
    assert_eq!(convs[0].peer.as_deref(), Some("!20"));

    let texts: Vec<String> = state
        .get_messages(&canonical_key("!10", "!20"))
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["hello?", "hi back"]);
}

#[test]
fn test_concurrent_ingest_respects_caps() {
    let config = Config {
        max_msgs_per_conv: 10,
        history_maxlen: 8,
        history_sample_secs: 0.5,
        ..Default::default()
    };
    let state = MeshState::new(&config);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let state = state.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for node in state.list_summaries() {
                        assert!(state.get_history(&node.node_id, Metric::Battery).len() <= 8);
                    }
                    for conv in state.list_conversations() {
                        assert!(conv.message_count <= 10);
                        assert!(state.get_messages(&conv.key).len() <= 10);
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let state = state.clone();
            thread::spawn(move || {
                let node = format!("!n{}", w);
                for i in 0..200 {
                    let t = i as f64;
                    state.ingest_packet_at(&text(&node, "!hub", &format!("m{}", i)), t);
                    state.ingest_packet_at(&telemetry(&node, t), t);
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(state.my_node_id().as_deref(), Some("!hub"));
    for w in 0..4 {
        let node = format!("!n{}", w);
        let msgs = state.get_messages(&canonical_key(&node, "!hub"));
        assert_eq!(msgs.len(), 10);
        assert_eq!(msgs[9].text, "m199");
        assert_eq!(state.get_history(&node, Metric::Battery).len(), 8);
    }
    assert_eq!(state.list_conversations().len(), 4);
}
