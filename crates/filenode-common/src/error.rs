//! Error types for the filenode
//!
//! This module defines the common error type used throughout the system.

use crate::types::CidParseError;
use thiserror::Error;

/// Common result type for filenode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the filenode
#[derive(Debug, Error)]
pub enum Error {
    // Not-found errors
    #[error("cids do not exist")]
    CidsNotExist,

    #[error("space is deleted")]
    SpaceIsDeleted,

    // Quota errors
    #[error("space limit exceeded")]
    LimitExceed,

    #[error("not enough space")]
    NotEnoughSpace,

    // Integrity errors
    #[error("space {space_id} belongs to group {actual}, not {expected}")]
    GroupMismatch {
        space_id: String,
        expected: String,
        actual: String,
    },

    #[error("key collision: {0}")]
    KeyCollision(String),

    #[error("invalid cid: {0}")]
    InvalidCid(#[from] CidParseError),

    // Infrastructure errors
    #[error("unable to acquire lock: {0}")]
    LockNotAcquired(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("block store error: {0}")]
    BlockStore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a fast-tier store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a block store error
    pub fn block_store(msg: impl Into<String>) -> Self {
        Self::BlockStore(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockNotAcquired(_) | Self::Store(_) | Self::DeadlineExceeded
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::CidsNotExist | Self::SpaceIsDeleted)
    }

    /// Get the HTTP status code used by the diagnostic endpoints
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidCid(_) => 400,

            // 403 Forbidden
            Self::LimitExceed | Self::NotEnoughSpace => 403,

            // 404 Not Found
            Self::CidsNotExist | Self::SpaceIsDeleted => 404,

            // 409 Conflict
            Self::GroupMismatch { .. } | Self::KeyCollision(_) => 409,

            // 500 Internal Server Error
            Self::Internal(_)
            | Self::Io(_)
            | Self::BlockStore(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => 500,

            // 503 Service Unavailable
            Self::LockNotAcquired(_) | Self::Store(_) | Self::Configuration(_) => 503,

            // 504 Gateway Timeout
            Self::DeadlineExceeded => 504,
        }
    }
}
