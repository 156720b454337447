/// Ingest task: applies transport events to the state in arrival order
use crate::mesh::transport::TransportEvent;
use crate::state::MeshState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Bound of the transport -> ingest queue
pub const INGEST_QUEUE_CAPACITY: usize = 1024;

/// Consume `events` until every sender is dropped.
pub async fn run_ingest(state: MeshState, mut events: mpsc::Receiver<TransportEvent>) {
    let mut applied: u64 = 0;
    while let Some(event) = events.recv().await {
        state.handle_transport_event(event);
        applied += 1;
    }
    debug!("Ingest queue closed after {} events", applied);
}

pub fn spawn_ingest(state: MeshState, events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(run_ingest(state, events))
}
