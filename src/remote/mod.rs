//! Boundary adapters for actors hosted on other nodes: the pluggable
//! transport seam and the at-least-once message store contract.

mod store;
mod transport;

pub use self::store::{FileMessageStore, MessageStatus, MessageStore, StoreError};
pub use self::transport::{InboundHandler, RemoteEnvelope, Transport, TransportError};
