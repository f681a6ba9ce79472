use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use crate::actor::{Message, RequestError};
use crate::sync::SegmentedMap;

pub(crate) struct PendingRequest {
    tx: oneshot::Sender<Result<Message, RequestError>>,
    deadline: Instant,
}

/// System-wide correlation table for in-flight ask-patterns:
/// `responseId → (resolver, deadline)`. Entries leave on response, caller
/// timeout, or the background reaper.
pub(crate) struct RequestTable {
    entries: SegmentedMap<String, PendingRequest>,
}

impl RequestTable {
    pub(crate) fn new() -> RequestTable {
        RequestTable {
            entries: SegmentedMap::new(),
        }
    }

    pub(crate) fn register(
        &self,
        response_id: String,
        tx: oneshot::Sender<Result<Message, RequestError>>,
        deadline: Instant,
    ) {
        self.entries
            .insert(response_id, PendingRequest { tx, deadline });
    }

    pub(crate) fn contains(&self, response_id: &str) -> bool {
        self.entries.contains_key(&response_id.to_string())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolves a pending request. Returns `false` when the entry already
    /// expired or was resolved.
    pub(crate) fn complete(
        &self,
        response_id: &str,
        result: Result<Message, RequestError>,
    ) -> bool {
        match self.entries.remove(&response_id.to_string()) {
            Some(pending) => pending.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drops an entry without resolving it (caller already gave up).
    pub(crate) fn remove(&self, response_id: &str) -> bool {
        self.entries.remove(&response_id.to_string()).is_some()
    }

    /// Rejects every entry whose deadline has passed. Returns how many were
    /// reaped.
    pub(crate) fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for id in self.entries.keys() {
            if let Some(pending) = self.entries.remove_if(&id, |p| p.deadline <= now) {
                let _ = pending.tx.send(Err(RequestError::Timeout));
                reaped += 1;
            }
        }
        if reaped > 0 {
            trace!(reaped, "expired requests reaped");
        }
        reaped
    }
}
