use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PersistenceError;

use super::versioned::{Backend, Manifest, VersionedStore};

/// In-memory session store. Same encoding and verification as the file
/// store; nothing survives the process.
pub type MemorySessionStore = VersionedStore<MemoryBackend>;

impl VersionedStore<MemoryBackend> {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::default())
    }
}

impl Default for VersionedStore<MemoryBackend> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SessionBlobs {
    manifest: Option<Manifest>,
    versions: HashMap<String, Vec<u8>>,
    working: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryBackend {
    sessions: Mutex<HashMap<String, SessionBlobs>>,
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn load_manifest(&self, session_id: &str) -> Result<Option<Manifest>, PersistenceError> {
        let sessions = self.sessions.lock();
        Ok(sessions.get(session_id).and_then(|s| s.manifest.clone()))
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(manifest.session_id.clone())
            .or_default()
            .manifest = Some(manifest.clone());
        Ok(())
    }

    async fn load_version(
        &self,
        session_id: &str,
        version_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let sessions = self.sessions.lock();
        Ok(sessions
            .get(session_id)
            .and_then(|s| s.versions.get(version_id).cloned()))
    }

    async fn save_version(
        &self,
        session_id: &str,
        version_id: &str,
        bytes: &[u8],
    ) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_default()
            .versions
            .insert(version_id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load_working(&self, session_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let sessions = self.sessions.lock();
        Ok(sessions.get(session_id).and_then(|s| s.working.clone()))
    }

    async fn save_working(&self, session_id: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock();
        sessions.entry(session_id.to_string()).or_default().working = Some(bytes.to_vec());
        Ok(())
    }

    async fn session_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let sessions = self.sessions.lock();
        let mut ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.manifest.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
