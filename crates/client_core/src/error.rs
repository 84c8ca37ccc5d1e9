use shared::domain::{ConversationId, Sequence};
use storage::{PreconditionFailed, StorageUnsupported};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or remote-service failure, passed through as the collaborator reported it.
    #[error(transparent)]
    Transport(anyhow::Error),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
    #[error(
        "continuation token conflict for conversation {conversation_id}: expected {expected:?}, found {found:?}"
    )]
    Conflict {
        conversation_id: ConversationId,
        expected: Option<Sequence>,
        found: Option<Sequence>,
    },
    #[error("durable storage is not supported on this platform: {0}")]
    UnsupportedPlatform(String),
    #[error("session expired; restart the session to continue")]
    SessionExpired,
    #[error("no active session")]
    NotConnected,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn transport(err: anyhow::Error) -> Self {
        Self::Transport(err)
    }

    /// Classifies a record store failure. Stale token preconditions become
    /// [`SyncError::Conflict`]; everything else keeps the backend's detail.
    pub(crate) fn from_store(conversation_id: Option<&ConversationId>, err: anyhow::Error) -> Self {
        if let Some(unsupported) = err.downcast_ref::<StorageUnsupported>() {
            return Self::UnsupportedPlatform(unsupported.reason.clone());
        }
        if let (Some(conversation_id), Some(failure)) =
            (conversation_id, err.downcast_ref::<PreconditionFailed>())
        {
            return Self::Conflict {
                conversation_id: conversation_id.clone(),
                expected: failure.expected.map(to_sequence),
                found: failure.found.map(to_sequence),
            };
        }
        Self::Storage(err)
    }

    /// Whether the caller should re-fetch and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnsupportedPlatform(_) | Self::SessionExpired)
    }
}

pub(crate) fn to_sequence(position: i64) -> Sequence {
    position.max(0) as Sequence
}

/// Record positions are signed; a sequence beyond `i64::MAX` cannot be stored.
pub(crate) fn to_position(sequence: Sequence) -> SyncResult<i64> {
    i64::try_from(sequence).map_err(|_| {
        SyncError::Storage(anyhow::anyhow!(
            "sequence {sequence} exceeds the storable range"
        ))
    })
}
