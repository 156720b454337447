/// JSON HTTP API + SSE over the aggregated mesh state
///
/// Endpoints:
///   GET  /api/health
///   GET  /api/nodes
///   GET  /api/nodes/:id
///   GET  /api/history            ?node=..&metric=..&n=N
///   GET  /api/conversations
///   GET  /api/messages           ?conv=..&since=T&n=N&include_broadcast=1
///   GET  /api/reply-target       ?conv=..
///   POST /api/send               body: {"to"?, "conv"?, "text", "wantAck"?, "channelIndex"?}
///   GET  /events                 SSE stream of MeshEvent JSON
use crate::error::{MeshError, Result};
use crate::events::MeshEvent;
use crate::mesh::packet::BROADCAST_ADDR;
use crate::state::{MeshState, SendRequest};
use crate::store::conversations::{ConversationKey, MessageQuery};
use crate::store::history::Metric;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

const DEFAULT_HISTORY_POINTS: usize = 300;
const MAX_HISTORY_POINTS: usize = 1000;
const DEFAULT_MESSAGES: usize = 200;
const MAX_MESSAGES: usize = 5000;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty_body() -> BoxBody {
    Full::new(bytes::Bytes::new()).boxed()
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "ok": false, "error": msg })).unwrap_or_default(),
    )
}

fn sse_resp(rx: tokio::sync::broadcast::Receiver<MeshEvent>) -> Resp {
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("event: {}\ndata: {}\n\n", event.kind(), json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

// ─── Entry points ────────────────────────────────────────────────────────────

/// Bind `addr` and serve forever
pub async fn start_api_server(state: MeshState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: MeshState) -> Result<()> {
    info!("API listening on http://{}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        if !e.is_incomplete_message() {
                            error!("API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, state: MeshState) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/health") => json_value(&state.health()),
        (Method::GET, "/api/nodes") => json_ok(serde_json::json!({ "nodes": state.list_summaries() })),
        (Method::GET, "/api/history") => get_history(&query, &state),
        (Method::GET, "/api/conversations") => get_conversations(&state),
        (Method::GET, "/api/messages") => get_messages(&query, &state),
        (Method::GET, "/api/reply-target") => get_reply_target(&query, &state),
        (Method::POST, "/api/send") => post_send(req, &state).await,
        (Method::GET, "/events") => sse_resp(state.subscribe()),
        _ => {
            if method == Method::GET && path.starts_with("/api/nodes/") {
                let raw = path.trim_start_matches("/api/nodes/");
                let node_id = urlencoding::decode(raw)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| raw.to_string());
                return match state.get_summary(&node_id) {
                    Some(node) => json_value(&node),
                    None => json_err(StatusCode::NOT_FOUND, "unknown node"),
                };
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn get_history(query: &str, state: &MeshState) -> Resp {
    let n = parse_query::<usize>(query, "n")
        .unwrap_or(DEFAULT_HISTORY_POINTS)
        .clamp(1, MAX_HISTORY_POINTS);

    match (query_param(query, "node"), query_param(query, "metric")) {
        (Some(node), Some(metric)) => {
            let metric: Metric = match metric.parse() {
                Ok(m) => m,
                Err(e) => return json_err(StatusCode::BAD_REQUEST, &e),
            };
            let points = state.get_history(&node, metric);
            let skip = points.len().saturating_sub(n);
            json_ok(serde_json::json!({
                "node": node,
                "metric": metric,
                "points": &points[skip..],
            }))
        }
        (Some(node), None) => {
            let mut snapshot = state.history_snapshot(Some(n));
            snapshot.retain(|id, _| *id == node);
            json_ok(serde_json::json!({ "history": snapshot }))
        }
        _ => json_ok(serde_json::json!({ "history": state.history_snapshot(Some(n)) })),
    }
}

fn get_conversations(state: &MeshState) -> Resp {
    json_ok(serde_json::json!({
        "my_node_id": state.my_node_id(),
        "conversations": state.list_conversations(),
    }))
}

fn get_messages(query: &str, state: &MeshState) -> Resp {
    let key = match conversation_param(query) {
        Ok(k) => k,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &e),
    };
    let q = MessageQuery {
        since: parse_query::<f64>(query, "since"),
        limit: Some(
            parse_query::<usize>(query, "n")
                .unwrap_or(DEFAULT_MESSAGES)
                .clamp(1, MAX_MESSAGES),
        ),
        include_broadcast: query_param(query, "include_broadcast")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false),
    };
    json_ok(serde_json::json!({
        "conv": key,
        "my_node_id": state.my_node_id(),
        "messages": state.query_messages(&key, &q),
    }))
}

fn get_reply_target(query: &str, state: &MeshState) -> Resp {
    let key = match conversation_param(query) {
        Ok(k) => k,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &e),
    };
    json_ok(serde_json::json!({
        "conv": key,
        "to": state.resolve_reply_target(&key),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    to: Option<String>,
    conv: Option<String>,
    #[serde(default)]
    text: String,
    want_ack: Option<bool>,
    channel_index: Option<u32>,
}

async fn post_send(req: Request<hyper::body::Incoming>, state: &MeshState) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let body: SendBody = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };

    let thread = match body.conv.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => match c.parse::<ConversationKey>() {
            Ok(k) => Some(k),
            Err(e) => return json_err(StatusCode::BAD_REQUEST, &e),
        },
        None => None,
    };
    let to = thread
        .as_ref()
        .and_then(|k| state.resolve_reply_target(k))
        .or(body.to)
        .unwrap_or_default();

    let request = SendRequest {
        to,
        text: body.text,
        want_ack: body.want_ack,
        channel_index: body.channel_index.unwrap_or(0),
        thread,
    };
    match state.send_text(request) {
        Ok(recorded) => json_ok(serde_json::json!({
            "ok": true,
            "to": recorded.message.to,
            "conv": recorded.key,
            "message": recorded.message,
        })),
        Err(e) => json_err(error_status(&e), &e.to_string()),
    }
}

fn error_status(e: &MeshError) -> StatusCode {
    match e {
        MeshError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MeshError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        MeshError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn json_value<T: serde::Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

/// `conv` query parameter, defaulting to the broadcast thread
fn conversation_param(query: &str) -> std::result::Result<ConversationKey, String> {
    query_param(query, "conv")
        .unwrap_or_else(|| BROADCAST_ADDR.to_string())
        .parse()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            let v = v.replace('+', " ");
            return urlencoding::decode(&v).ok().map(|s| s.into_owned());
        }
    }
    None
}

fn parse_query<T: std::str::FromStr>(query: &str, key: &str) -> Option<T> {
    query_param(query, key).and_then(|v| v.parse().ok())
}
