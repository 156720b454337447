/// meshdash - live aggregation of a Meshtastic-style radio mesh
///
/// Ingests decoded packets from one connected node, keeps per-node summaries, bounded
/// metric history and pair-threaded conversations, and serves them over a JSON API.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod ingest;
pub mod mesh;
pub mod sink;
pub mod state;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{MeshError, Result};
pub use events::MeshEvent;
pub use state::{MeshState, SendRequest};
