use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actor::{Message, Pid};

/// The UTF-8 JSON object that crosses a transport boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub id: String,
    pub to: Pid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Pid>,
    pub message: Message,
}

impl RemoteEnvelope {
    pub fn new(to: Pid, from: Option<Pid>, message: Message) -> RemoteEnvelope {
        RemoteEnvelope {
            id: Uuid::new_v4().to_string(),
            to,
            from,
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::new(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<RemoteEnvelope, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::new(e.to_string()))
    }
}

pub type InboundHandler = Arc<dyn Fn(RemoteEnvelope) + Send + Sync>;

/// Pluggable boundary for remote nodes. The runtime only defines the hook
/// points; concrete network transports live outside this crate.
///
/// Delivery is at-most-once unless the system also registers a
/// [`MessageStore`](crate::remote::MessageStore).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Delivers one envelope to the node at `address`.
    async fn send(&self, address: &str, envelope: RemoteEnvelope) -> Result<(), TransportError>;

    /// Pre-establishes a connection to `address`.
    async fn dial(&self, address: &str) -> Result<(), TransportError>;

    /// Installs the callback invoked for every inbound envelope.
    fn set_message_handler(&self, handler: InboundHandler);

    fn local_address(&self) -> String;

    fn listen_addresses(&self) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> TransportError {
        TransportError {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl Error for TransportError {}
