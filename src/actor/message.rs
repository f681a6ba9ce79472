use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actor::{ActorError, Pid};

/// Reserved prefix for lifecycle traffic.
pub const SYSTEM_PREFIX: &str = "$system.";

pub const SYSTEM_INIT: &str = "$system.init";
pub const SYSTEM_RESTART: &str = "$system.restart";
pub const SYSTEM_STOP: &str = "$system.stop";
pub const SYSTEM_FAILURE: &str = "$system.failure";
/// Delivery acknowledgement for store-backed remote sends.
pub const SYSTEM_ACK: &str = "$system.ack";

/// A unit of actor traffic. Immutable once enqueued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Pid>,
    #[serde(
        rename = "responseId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Message {
        Message {
            msg_type: msg_type.into(),
            payload,
            sender: None,
            response_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_sender(mut self, sender: Pid) -> Message {
        self.sender = Some(sender);
        self
    }

    pub fn with_response_id(mut self, response_id: impl Into<String>) -> Message {
        self.response_id = Some(response_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Message {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True for reserved `$system.`-prefixed lifecycle messages.
    pub fn is_system(&self) -> bool {
        self.msg_type.starts_with(SYSTEM_PREFIX)
    }
}

/// Typed form of the reserved lifecycle messages that travel on a mailbox's
/// system queue.
#[derive(Clone, Debug)]
pub enum SystemMsg {
    /// Delivered exactly once after spawn, before any user message.
    Init,
    Restart {
        reason: ActorError,
    },
    Stop,
    Failure {
        child: Pid,
        error: ActorError,
    },
}

impl SystemMsg {
    /// Wire form, used when lifecycle traffic crosses a transport boundary.
    pub fn to_message(&self) -> Message {
        match self {
            SystemMsg::Init => Message::new(SYSTEM_INIT, Value::Null),
            SystemMsg::Restart { reason } => {
                Message::new(SYSTEM_RESTART, json!({ "reason": reason.to_string() }))
            }
            SystemMsg::Stop => Message::new(SYSTEM_STOP, json!({})),
            SystemMsg::Failure { child, error } => Message::new(
                SYSTEM_FAILURE,
                json!({ "child": child, "error": error.to_string() }),
            ),
        }
    }

    /// Parses a reserved message back into its typed form. Returns `None`
    /// for non-system or unrecognized types.
    pub fn from_message(msg: &Message) -> Option<SystemMsg> {
        match msg.msg_type.as_str() {
            SYSTEM_INIT => Some(SystemMsg::Init),
            SYSTEM_STOP => Some(SystemMsg::Stop),
            SYSTEM_RESTART => {
                let reason = msg
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("restart requested");
                Some(SystemMsg::Restart {
                    reason: ActorError::new(reason),
                })
            }
            SYSTEM_FAILURE => {
                let child: Pid = serde_json::from_value(msg.payload.get("child")?.clone()).ok()?;
                let error = msg
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("failure");
                Some(SystemMsg::Failure {
                    child,
                    error: ActorError::new(error),
                })
            }
            _ => None,
        }
    }
}
