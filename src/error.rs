//! Error types for the membership store.

use crate::types::{ConversationId, MembershipId, PlayerId, StatusKind};
use thiserror::Error;

/// Main error type for membership operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A player holds more than one non-terminal membership. This is a
    /// data-integrity bug and is never retried or healed automatically.
    #[error("Player {0} is in multiple conversations")]
    InvariantViolation(PlayerId),

    #[error("Player {player} is already active in conversation {conversation}")]
    PlayerAlreadyActive {
        player: PlayerId,
        conversation: ConversationId,
    },

    #[error("Player {player} already has an active membership in conversation {conversation}")]
    MembershipExists {
        conversation: ConversationId,
        player: PlayerId,
    },

    #[error("Membership not found: {0}")]
    MembershipNotFound(MembershipId),

    #[error("Row {id} of table {table} is not loaded in the working set")]
    RowNotLoaded { table: &'static str, id: String },

    #[error("Illegal transition for membership {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: MembershipId,
        from: StatusKind,
        to: StatusKind,
    },

    #[error("Membership {0} cannot change its conversation or player")]
    KeyChanged(MembershipId),

    #[error("Malformed status: {0}")]
    MalformedStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl StoreError {
    /// Whether this error comes from the storage layer rather than from
    /// membership semantics.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Serialization(_)
                | StoreError::Deserialization(_)
                | StoreError::Corruption(_)
                | StoreError::InvalidFormat(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::Locked
                | StoreError::NotInitialized
                | StoreError::Transaction(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for membership operations.
pub type Result<T> = std::result::Result<T, StoreError>;
