//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the domain primitives
/// (parsing ids and names). Storage and transport concerns belong to the sync
/// crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A name did not match any entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    /// A name did not match any operation.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
