mod actor;
mod context;
mod message;
mod pid;
mod props;
mod router;
mod supervision;

pub use self::actor::{Actor, Behaviors, Handler, HandlerFuture, DEFAULT_BEHAVIOR};
pub use self::context::Context;
pub use self::message::{
    Message, SystemMsg, SYSTEM_ACK, SYSTEM_FAILURE, SYSTEM_INIT, SYSTEM_PREFIX, SYSTEM_RESTART,
    SYSTEM_STOP,
};
pub use self::pid::Pid;
pub use self::props::Props;
pub use self::router::{Router, RouterActor, RouterConfig, RouterStrategy};
pub use self::supervision::{Directive, RestartTracker, SupervisionScope, SupervisorStrategy};

pub(crate) use self::context::{CellState, Dock};

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure raised by an actor's handler or lifecycle hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorError {
    pub message: String,
}

impl ActorError {
    pub fn new(message: impl Into<String>) -> ActorError {
        ActorError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ActorError {}

impl From<&str> for ActorError {
    fn from(message: &str) -> ActorError {
        ActorError::new(message)
    }
}

impl From<String> for ActorError {
    fn from(message: String) -> ActorError {
        ActorError { message }
    }
}

/// Error type when a message cannot be accepted by the target's mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendError {
    /// No actor registered under the target pid.
    UnknownTarget(Pid),
    /// Bounded mailbox at capacity and not resizable.
    MailboxFull(Pid),
    /// The target's mailbox no longer accepts messages.
    MailboxClosed(Pid),
    /// The pid names a remote address but no transport is registered.
    NoTransport(String),
    /// The registered transport failed to deliver.
    Transport(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownTarget(pid) => {
                write!(
                    f,
                    "no actor registered at {}. It may have been terminated",
                    pid
                )
            }
            SendError::MailboxFull(pid) => write!(f, "mailbox full for {}", pid),
            SendError::MailboxClosed(pid) => write!(f, "mailbox closed for {}", pid),
            SendError::NoTransport(addr) => {
                write!(f, "no transport registered for address {}", addr)
            }
            SendError::Transport(cause) => write!(f, "transport failure: {}", cause),
        }
    }
}

impl Error for SendError {}

/// Error type when an actor fails to start during `spawn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpawnError {
    InvalidName(String),
    AlreadyExists(String),
    SystemShuttingDown,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::InvalidName(name) => {
                write!(f, "failed to spawn actor: invalid name ({})", name)
            }
            SpawnError::AlreadyExists(path) => write!(
                f,
                "failed to spawn actor: an actor at the same path already exists ({})",
                path
            ),
            SpawnError::SystemShuttingDown => {
                f.write_str("failed to spawn actor: system is shutting down")
            }
        }
    }
}

impl Error for SpawnError {}

/// Error type when a `request` cannot produce a response.
#[derive(Debug)]
pub enum RequestError {
    /// The request message was never accepted.
    Send(SendError),
    /// The deadline passed before a response arrived.
    Timeout,
    /// The responder rejected the request.
    Rejected(ActorError),
    /// The request table entry vanished without a response.
    Canceled,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Send(e) => write!(f, "request not sent: {}", e),
            RequestError::Timeout => f.write_str("request timed out"),
            RequestError::Rejected(e) => write!(f, "request rejected: {}", e),
            RequestError::Canceled => f.write_str("request canceled"),
        }
    }
}

impl Error for RequestError {}

impl From<SendError> for RequestError {
    fn from(e: SendError) -> RequestError {
        RequestError::Send(e)
    }
}
