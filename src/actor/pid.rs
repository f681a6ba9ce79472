use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque actor identifier: a stable `id` unique within one system, plus an
/// optional transport `address` for actors hosted on another node.
///
/// Holders treat a `Pid` as a routing key only; it never grants access to
/// the actor's state.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pid {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Pid {
    pub fn local(id: impl Into<String>) -> Pid {
        Pid {
            id: id.into(),
            address: None,
        }
    }

    pub fn remote(id: impl Into<String>, address: impl Into<String>) -> Pid {
        Pid {
            id: id.into(),
            address: Some(address.into()),
        }
    }

    /// True when the pid carries no address or the given local address.
    pub fn is_local_to(&self, local_address: &str) -> bool {
        match &self.address {
            None => true,
            Some(addr) => addr == local_address,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => f.write_str(&self.id),
        }
    }
}
