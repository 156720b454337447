/// TCP client for a newline-delimited JSON packet bridge
///
/// Inbound lines: `{"type":"packet","packet":{..}}`, `{"type":"my_info","node_id":".."}`
/// or a bare packet object. Outbound lines: `{"type":"send_text",..}`.
use crate::config::Config;
use crate::error::{MeshError, Result};
use crate::mesh::transport::{OutboundText, TextSender, TransportEvent};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand {
    SendText(OutboundText),
}

/// Cloneable send side of a bridge
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
}

impl TextSender for BridgeHandle {
    fn send_text(&self, text: &OutboundText) -> Result<()> {
        self.commands
            .send(BridgeCommand::SendText(text.clone()))
            .map_err(|_| MeshError::Transport("bridge task has stopped".to_string()))
    }
}

/// Connection loop; run it with `run`
pub struct BridgeTransport {
    addr: String,
    connect_timeout: Duration,
    max_backoff: Duration,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
}

/// Create a bridge that reports to `events`.
pub fn bridge(config: &Config, events: mpsc::Sender<TransportEvent>) -> (BridgeTransport, BridgeHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BridgeTransport {
            addr: config.bridge_addr.clone(),
            connect_timeout: config.connect_timeout,
            max_backoff: config.max_backoff,
            events,
            commands: rx,
        },
        BridgeHandle { commands: tx },
    )
}

impl BridgeTransport {
    /// Connect, pump lines, reconnect with exponential backoff. Returns once the event
    /// receiver is gone.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    info!("Connected to packet bridge at {}", self.addr);
                    backoff = INITIAL_BACKOFF;
                    self.drop_stale_commands();

                    if self
                        .events
                        .send(TransportEvent::Connected { local_node_id: None })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    match self.session(stream).await {
                        Ok(()) => info!("Packet bridge closed the connection"),
                        Err(e) => warn!("Packet bridge connection lost: {}", e),
                    }

                    if self.events.send(TransportEvent::Disconnected).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to packet bridge {}: {}", self.addr, e),
                Err(_) => warn!("Connection timeout to packet bridge {}", self.addr),
            }

            if self.events.is_closed() {
                return;
            }
            debug!("Reconnecting in {:?}", backoff);
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Sends queued while disconnected are not replayed
    fn drop_stale_commands(&mut self) {
        let mut dropped = 0;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropped {} sends queued while disconnected", dropped);
        }
    }

    async fn session(&mut self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_line(trimmed) {
                        Some(event) => {
                            if self.events.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => debug!("Skipping undecodable bridge line"),
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    let mut json = serde_json::to_vec(&command)?;
                    json.push(b'\n');
                    writer.write_all(&json).await?;
                    debug!("Wrote {:?} to bridge", command);
                }
            }
        }
    }
}

/// Decode one inbound line; `None` for anything not understood.
pub fn parse_line(line: &str) -> Option<TransportEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    match value.get("type").and_then(Value::as_str) {
        Some("packet") => value.get("packet").cloned().map(TransportEvent::Packet),
        Some("my_info") => {
            let id = value.get("node_id").and_then(Value::as_str)?;
            Some(TransportEvent::Connected {
                local_node_id: Some(id.to_string()),
            })
        }
        Some(_) => None,
        None => Some(TransportEvent::Packet(value)),
    }
}
