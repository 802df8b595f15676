pub mod diff;
pub mod file_store;
pub mod memory_store;
pub mod snapshot;
mod versioned;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::{ExecutionEvent, StepResult, WorkflowSession};
use crate::error::PersistenceError;

pub use diff::{AgentsDiff, FieldChange, HistoryDiff, SnapshotDiff};
pub use file_store::FileSessionStore;
pub use memory_store::MemorySessionStore;
pub use snapshot::SessionSnapshot;
pub use versioned::{Backend, Manifest, VersionedStore};

/// Full durable state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub workflow: WorkflowSession,
    /// Step id to its (latest) result.
    #[serde(default)]
    pub agent_contexts: BTreeMap<String, StepResult>,
    /// Every execution event recorded so far.
    #[serde(default)]
    pub history: Vec<ExecutionEvent>,
}

impl SessionState {
    pub fn new(workflow: WorkflowSession) -> Self {
        Self {
            workflow,
            agent_contexts: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(workflow) = patch.workflow {
            self.workflow = workflow;
        }
        self.agent_contexts.extend(patch.agent_contexts);
        self.history.extend(patch.history);
    }
}

/// Partial update: replace the workflow, upsert results, append history.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub workflow: Option<WorkflowSession>,
    pub agent_contexts: BTreeMap<String, StepResult>,
    pub history: Vec<ExecutionEvent>,
}

/// Trait for versioned session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session and return its first version id.
    async fn create(&self, session_id: &str, state: &SessionState) -> Result<String, PersistenceError>;

    /// Merge `patch` into the session's working copy. With `snapshot`,
    /// also commit a new version and return its id.
    async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
        snapshot: bool,
    ) -> Result<Option<String>, PersistenceError>;

    /// Rebuild the state at `version_id`, or at the latest version.
    async fn resume(
        &self,
        session_id: &str,
        version_id: Option<&str>,
    ) -> Result<SessionState, PersistenceError>;

    /// Ordered version ids of a session, oldest first.
    async fn versions(&self, session_id: &str) -> Result<Vec<String>, PersistenceError>;

    /// Working-copy workflow of every stored session.
    async fn list_sessions(&self) -> Result<Vec<WorkflowSession>, PersistenceError>;

    /// Compare two versions of a session.
    async fn diff(
        &self,
        session_id: &str,
        v1: &str,
        v2: &str,
    ) -> Result<SnapshotDiff, PersistenceError> {
        let a = self.resume(session_id, Some(v1)).await?;
        let b = self.resume(session_id, Some(v2)).await?;
        Ok(diff::compute_diff(&a, &b))
    }
}

/// Session ids become directory names.
pub(crate) fn validate_session_id(session_id: &str) -> Result<(), PersistenceError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidSessionId(session_id.to_string()))
    }
}
