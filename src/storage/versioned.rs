use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::engine::types::WorkflowSession;
use crate::error::PersistenceError;

use super::snapshot::{SessionSnapshot, sha256_hex};
use super::{SessionPatch, SessionState, SessionStore, validate_session_id};

/// Ordered version list of one session, plus how much history is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub session_id: String,
    pub versions: Vec<String>,
    pub committed_history: usize,
    #[serde(default)]
    pub checksum: String,
}

impl Manifest {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            versions: Vec::new(),
            committed_history: 0,
            checksum: String::new(),
        }
    }

    fn compute_checksum(&self) -> String {
        let body = serde_json::json!({
            "session_id": self.session_id,
            "versions": self.versions,
            "committed_history": self.committed_history,
        });
        sha256_hex(body.to_string().as_bytes())
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify(&self) -> Result<(), PersistenceError> {
        if self.checksum == self.compute_checksum() {
            Ok(())
        } else {
            Err(PersistenceError::ChecksumMismatch {
                session_id: self.session_id.clone(),
                version_id: "manifest".to_string(),
            })
        }
    }
}

/// Raw storage underneath a [`VersionedStore`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn load_manifest(&self, session_id: &str) -> Result<Option<Manifest>, PersistenceError>;
    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), PersistenceError>;
    async fn load_version(&self, session_id: &str, version_id: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    async fn save_version(&self, session_id: &str, version_id: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
    async fn load_working(&self, session_id: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    async fn save_working(&self, session_id: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
    async fn session_ids(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Session store built from content-addressed snapshots on a [`Backend`].
///
/// Each session has a working copy (updated on every call) and an
/// append-only chain of versions. All operations on one session are
/// serialized by a per-session async mutex.
pub struct VersionedStore<B> {
    backend: B,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<B: Backend> VersionedStore<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    async fn manifest(&self, session_id: &str) -> Result<Manifest, PersistenceError> {
        let manifest = self
            .backend
            .load_manifest(session_id)
            .await?
            .ok_or_else(|| PersistenceError::SessionNotFound(session_id.to_string()))?;
        manifest.verify()?;
        Ok(manifest)
    }

    async fn working(&self, session_id: &str) -> Result<SessionState, PersistenceError> {
        let bytes = self
            .backend
            .load_working(session_id)
            .await?
            .ok_or_else(|| PersistenceError::SessionNotFound(session_id.to_string()))?;
        let snapshot = SessionSnapshot::decode(session_id, None, &bytes)?;
        let history = snapshot.history_delta()?;
        snapshot.into_state(history)
    }

    async fn write_working(&self, session_id: &str, state: &SessionState) -> Result<(), PersistenceError> {
        let (_, bytes) = SessionSnapshot::capture(session_id, state, 0, None)?.encode()?;
        self.backend.save_working(session_id, &bytes).await
    }

    async fn commit(
        &self,
        manifest: &mut Manifest,
        state: &SessionState,
    ) -> Result<String, PersistenceError> {
        let parent = manifest.versions.last().cloned();
        let snapshot = SessionSnapshot::capture(&manifest.session_id, state, manifest.committed_history, parent)?;
        let (version_id, bytes) = snapshot.encode()?;
        self.backend
            .save_version(&manifest.session_id, &version_id, &bytes)
            .await?;
        manifest.versions.push(version_id.clone());
        manifest.committed_history = state.history.len();
        manifest.seal();
        debug!(
            session_id = %manifest.session_id,
            version = %version_id,
            versions = manifest.versions.len(),
            "Snapshot committed"
        );
        Ok(version_id)
    }
}

#[async_trait]
impl<B: Backend> SessionStore for VersionedStore<B> {
    async fn create(&self, session_id: &str, state: &SessionState) -> Result<String, PersistenceError> {
        validate_session_id(session_id)?;
        let _guard = self.lock(session_id).await;

        if self.backend.load_manifest(session_id).await?.is_some() {
            return Err(PersistenceError::SessionExists(session_id.to_string()));
        }

        let mut manifest = Manifest::new(session_id);
        let version_id = self.commit(&mut manifest, state).await?;
        self.write_working(session_id, state).await?;
        self.backend.save_manifest(&manifest).await?;
        Ok(version_id)
    }

    async fn update(
        &self,
        session_id: &str,
        patch: SessionPatch,
        snapshot: bool,
    ) -> Result<Option<String>, PersistenceError> {
        validate_session_id(session_id)?;
        let _guard = self.lock(session_id).await;

        let mut manifest = self.manifest(session_id).await?;
        let mut state = self.working(session_id).await?;
        state.apply(patch);

        let version_id = if snapshot {
            Some(self.commit(&mut manifest, &state).await?)
        } else {
            None
        };

        self.write_working(session_id, &state).await?;
        if version_id.is_some() {
            self.backend.save_manifest(&manifest).await?;
        }
        Ok(version_id)
    }

    async fn resume(
        &self,
        session_id: &str,
        version_id: Option<&str>,
    ) -> Result<SessionState, PersistenceError> {
        validate_session_id(session_id)?;
        let _guard = self.lock(session_id).await;

        let manifest = self.manifest(session_id).await?;
        let target = match version_id {
            Some(v) => manifest.versions.iter().position(|x| x == v).ok_or_else(|| {
                PersistenceError::VersionNotFound {
                    session_id: session_id.to_string(),
                    version_id: v.to_string(),
                }
            })?,
            None => manifest
                .versions
                .len()
                .checked_sub(1)
                .ok_or_else(|| PersistenceError::SessionNotFound(session_id.to_string()))?,
        };

        let mut history = Vec::new();
        let mut last = None;
        for version in &manifest.versions[..=target] {
            let bytes = self
                .backend
                .load_version(session_id, version)
                .await?
                .ok_or_else(|| PersistenceError::VersionNotFound {
                    session_id: session_id.to_string(),
                    version_id: version.clone(),
                })?;
            let snapshot = SessionSnapshot::decode(session_id, Some(version), &bytes)?;
            history.extend(snapshot.history_delta()?);
            last = Some(snapshot);
        }

        match last {
            Some(snapshot) => snapshot.into_state(history),
            None => Err(PersistenceError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn versions(&self, session_id: &str) -> Result<Vec<String>, PersistenceError> {
        validate_session_id(session_id)?;
        let _guard = self.lock(session_id).await;
        Ok(self.manifest(session_id).await?.versions)
    }

    async fn list_sessions(&self) -> Result<Vec<WorkflowSession>, PersistenceError> {
        let mut sessions = Vec::new();
        for session_id in self.backend.session_ids().await? {
            let _guard = self.lock(&session_id).await;
            match self.working(&session_id).await {
                Ok(state) => sessions.push(state.workflow),
                Err(e) => warn!(session_id = %session_id, error = %e, "Skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}
