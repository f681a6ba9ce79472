use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;

use crate::actor::Pid;
use crate::remote::RemoteEnvelope;

/// Delivery progress of one stored message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Acknowledged => "ACKNOWLEDGED",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<MessageStatus, StoreError> {
        match s.trim() {
            "PENDING" => Ok(MessageStatus::Pending),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "ACKNOWLEDGED" => Ok(MessageStatus::Acknowledged),
            other => Err(StoreError::new(format!("unknown status: {}", other))),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> StoreError {
        StoreError {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message store error: {}", self.message)
    }
}

impl Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> StoreError {
        StoreError::new(e.to_string())
    }
}

/// Persistence contract that upgrades remote delivery to at-least-once:
/// save before send, mark on transport success, acknowledge on the peer's
/// ack, and rescan the unacknowledged backlog to redeliver.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn save(&self, envelope: &RemoteEnvelope) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<RemoteEnvelope>, StoreError>;

    async fn mark_delivered(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_acknowledged(&self, id: &str) -> Result<(), StoreError>;

    /// Envelopes addressed to `receiver` that were never acknowledged.
    async fn get_unacknowledged(&self, receiver: &Pid) -> Result<Vec<RemoteEnvelope>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn message_status(&self, id: &str) -> Result<Option<MessageStatus>, StoreError>;
}

/// File-per-message store: `{id}.msg` holds the JSON envelope, `{id}.status`
/// one of `PENDING | DELIVERED | ACKNOWLEDGED`. Deleting a message removes
/// both files.
pub struct FileMessageStore {
    dir: PathBuf,
}

impl FileMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> FileMessageStore {
        FileMessageStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_id(id: &str) -> Result<(), StoreError> {
        if !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            Ok(())
        } else {
            Err(StoreError::new(format!("invalid message id: {:?}", id)))
        }
    }

    fn msg_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.msg", id))
    }

    fn status_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.status", id))
    }

    async fn write_status(&self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        Self::check_id(id)?;
        match tokio::fs::try_exists(self.msg_path(id)).await {
            Ok(true) => {}
            _ => return Err(StoreError::new(format!("no stored message {}", id))),
        }
        tokio::fs::write(self.status_path(id), status.as_str()).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save(&self, envelope: &RemoteEnvelope) -> Result<(), StoreError> {
        Self::check_id(&envelope.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body =
            serde_json::to_vec_pretty(envelope).map_err(|e| StoreError::new(e.to_string()))?;
        tokio::fs::write(self.msg_path(&envelope.id), body).await?;
        tokio::fs::write(
            self.status_path(&envelope.id),
            MessageStatus::Pending.as_str(),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RemoteEnvelope>, StoreError> {
        Self::check_id(id)?;
        match tokio::fs::read(self.msg_path(id)).await {
            Ok(bytes) => {
                let envelope =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::new(e.to_string()))?;
                Ok(Some(envelope))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_delivered(&self, id: &str) -> Result<(), StoreError> {
        self.write_status(id, MessageStatus::Delivered).await
    }

    async fn mark_acknowledged(&self, id: &str) -> Result<(), StoreError> {
        self.write_status(id, MessageStatus::Acknowledged).await
    }

    async fn get_unacknowledged(&self, receiver: &Pid) -> Result<Vec<RemoteEnvelope>, StoreError> {
        let mut unacknowledged = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(unacknowledged),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let id = match name.strip_suffix(".msg") {
                Some(id) => id.to_string(),
                None => continue,
            };
            if self.message_status(&id).await? == Some(MessageStatus::Acknowledged) {
                continue;
            }
            if let Some(envelope) = self.get(&id).await? {
                if envelope.to.id == receiver.id {
                    unacknowledged.push(envelope);
                }
            }
        }
        Ok(unacknowledged)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        Self::check_id(id)?;
        for path in [self.msg_path(id), self.status_path(id)] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".msg") || name.ends_with(".status") {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn message_status(&self, id: &str) -> Result<Option<MessageStatus>, StoreError> {
        Self::check_id(id)?;
        match tokio::fs::read_to_string(self.status_path(id)).await {
            Ok(content) => Ok(Some(content.parse()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
