use stockman_core::ActionId;

use crate::action::InvalidActionError;
use crate::remote::RemoteError;
use crate::storage::PersistenceError;

/// Errors surfaced to callers of the sync facade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("invalid action: {0}")]
    InvalidAction(#[from] InvalidActionError),

    #[error("rejected by server: {0}")]
    Rejected(RemoteError),

    #[error("action {0} not found")]
    NotFound(ActionId),
}

pub type SyncResult<T> = Result<T, SyncError>;
