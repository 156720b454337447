/// Packet decoding, classification and the transports that deliver packets
pub mod bridge;
pub mod classifier;
pub mod packet;
pub mod transport;

pub use classifier::{classify, Classified};
pub use packet::BROADCAST_ADDR;
pub use transport::{OutboundText, TextSender, TransportEvent};
