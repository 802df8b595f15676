//! Error taxonomy shared by the orchestrator, the session store and the bus.
//!
//! | Error | Scope | Recovery |
//! |-------|-------|----------|
//! | [`OrchestratorError::WorkflowPlanning`] | session | fatal, the session never starts |
//! | [`OrchestratorError::AgentExecution`] | step | retried per policy, then a failed step |
//! | [`OrchestratorError::InvalidModification`] | call | rejected, session untouched |
//! | [`PersistenceError`] | store | surfaced to the caller, never ignored |
//! | [`SubscriberOverflowError`] | subscriber | turned into an `overflow` marker |

use thiserror::Error;

use crate::engine::types::SessionStatus;

/// Errors raised by the workflow orchestrator's control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("workflow planning failed: {0}")]
    WorkflowPlanning(String),

    #[error("step '{step_id}' failed: {message}")]
    AgentExecution { step_id: String, message: String },

    #[error("invalid modification: {0}")]
    InvalidModification(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{session_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("workspace allocation failed: {0}")]
    Workspace(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors raised by [`crate::storage::SessionStore`] implementations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("checksum mismatch for session '{session_id}' version '{version_id}'")]
    ChecksumMismatch {
        session_id: String,
        version_id: String,
    },

    #[error("session '{0}' has no stored snapshots")]
    SessionNotFound(String),

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("version '{version_id}' not found for session '{session_id}'")]
    VersionNotFound {
        session_id: String,
        version_id: String,
    },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A subscriber's private queue was full when an event arrived.
#[derive(Debug, Clone, Error)]
#[error("subscriber {subscriber_id} overflowed ({dropped} event(s) dropped so far)")]
pub struct SubscriberOverflowError {
    pub subscriber_id: u64,
    pub dropped: u64,
}
