//! Error types for the escrow engine
//!
//! Every failure an operation can surface maps to a distinguishable variant
//! so callers (UIs and the deadline evaluator alike) can tell "already done"
//! apart from "not allowed" without parsing message strings.

use thiserror::Error;

use crate::models::EscrowStatus;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// No valid session or one-time token was presented
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// Authenticated, but the caller's role or ownership does not permit
    /// the requested operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Escrow or referenced entity does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Domain precondition unmet (no receipt yet, token consumed, deadline
    /// not reached, ...)
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Requested transition is illegal from the current status, including
    /// the lost-race case where a concurrent request moved the status first
    #[error("Invalid status transition: {from} -> {to}: {reason}")]
    Conflict {
        from: EscrowStatus,
        to: EscrowStatus,
        reason: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage or other infrastructure failure; the primary write did not
    /// commit and the escrow is unmutated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable error classification for automated callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    PreconditionFailed,
    Conflict,
    Config,
    Internal,
}

impl EscrowError {
    /// Create an authentication error
    pub fn unauthenticated<S: Into<String>>(msg: S) -> Self {
        Self::Unauthenticated(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(entity: S) -> Self {
        Self::NotFound(entity.into())
    }

    /// Create a precondition error
    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create a transition conflict error
    pub fn conflict<S: Into<String>>(from: EscrowStatus, to: EscrowStatus, reason: S) -> Self {
        Self::Conflict {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same call can ever succeed without the caller
    /// first re-reading current state or fixing its input
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal)
    }
}
