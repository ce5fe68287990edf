//! Error types for needlefs
//!
//! This module defines the common error types used throughout the system.

use crate::types::{FileIdError, NeedleId, VolumeId};
use thiserror::Error;

/// Common result type for needlefs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for needlefs
#[derive(Debug, Error)]
pub enum Error {
    // Request errors
    #[error("invalid file id: {0}")]
    InvalidFileId(#[from] FileIdError),

    #[error("cookie mismatch for needle {key} in volume {volume_id}")]
    CookieMismatch { volume_id: VolumeId, key: NeedleId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    // Lookup errors
    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(VolumeId),

    #[error("needle {key} not found in volume {volume_id}")]
    NeedleNotFound { volume_id: VolumeId, key: NeedleId },

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Sync errors
    #[error("volume mismatch: expected {expected}, leader reported {actual}")]
    VolumeMismatch { expected: VolumeId, actual: String },

    #[error("corrupt index stream: {leftover} trailing bytes do not form a record")]
    CorruptStream { leftover: usize },

    #[error("retryable transport failure: {0}")]
    Retryable(String),

    #[error("operation cancelled")]
    Cancelled,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a retryable transport error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VolumeNotFound(_) | Self::NeedleNotFound { .. }
        )
    }

    /// Get the HTTP status code used in per-entry results and admin responses
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidFileId(_) | Self::CookieMismatch { .. } | Self::InvalidArgument(_) => 400,

            // 404 Not Found
            Self::VolumeNotFound(_) | Self::NeedleNotFound { .. } => 404,

            // 406 Not Acceptable
            Self::NotAcceptable(_) => 406,

            // 409 Conflict
            Self::VolumeAlreadyExists(_) | Self::VolumeMismatch { .. } => 409,

            // 499 Client Closed Request
            Self::Cancelled => 499,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::Storage(_)
            | Self::ChecksumMismatch { .. }
            | Self::DataCorruption(_)
            | Self::CorruptStream { .. }
            | Self::Internal(_)
            | Self::Configuration(_) => 500,

            // 503 Service Unavailable
            Self::Retryable(_) => 503,
        }
    }
}
