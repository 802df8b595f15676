use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PersistenceError;

use super::SessionState;

/// Immutable, content-hashed capture of a session.
///
/// `history` holds only the events recorded since `parent`. The checksum
/// covers every other field in canonical (sorted-key) JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parent: Option<String>,
    pub workflow_state: serde_json::Value,
    pub agent_contexts: serde_json::Value,
    pub history: serde_json::Value,
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    session_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    parent: &'a Option<String>,
    workflow_state: &'a serde_json::Value,
    agent_contexts: &'a serde_json::Value,
    history: &'a serde_json::Value,
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl SessionSnapshot {
    /// Capture `state`, keeping history from index `history_from` onwards.
    pub fn capture(
        session_id: &str,
        state: &SessionState,
        history_from: usize,
        parent: Option<String>,
    ) -> Result<Self, PersistenceError> {
        let delta = state.history.get(history_from..).unwrap_or_default();
        let mut snapshot = Self {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            parent,
            workflow_state: serde_json::to_value(&state.workflow)?,
            agent_contexts: serde_json::to_value(&state.agent_contexts)?,
            history: serde_json::to_value(delta)?,
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    pub fn compute_checksum(&self) -> Result<String, PersistenceError> {
        let canonical = serde_json::to_vec(&ChecksumInput {
            session_id: &self.session_id,
            timestamp: &self.timestamp,
            parent: &self.parent,
            workflow_state: &self.workflow_state,
            agent_contexts: &self.agent_contexts,
            history: &self.history,
        })?;
        Ok(sha256_hex(&canonical))
    }

    /// Gzip-compressed JSON plus its content address (hex SHA-256 of the bytes).
    pub fn encode(&self) -> Result<(String, Vec<u8>), PersistenceError> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let bytes = encoder.finish()?;
        Ok((sha256_hex(&bytes), bytes))
    }

    /// Decode and verify. With `version_id`, the bytes must also hash to it.
    pub fn decode(
        session_id: &str,
        version_id: Option<&str>,
        bytes: &[u8],
    ) -> Result<Self, PersistenceError> {
        let label = version_id.unwrap_or("working");
        let mismatch = || PersistenceError::ChecksumMismatch {
            session_id: session_id.to_string(),
            version_id: label.to_string(),
        };

        if let Some(expected) = version_id
            && sha256_hex(bytes) != expected
        {
            return Err(mismatch());
        }

        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|_| mismatch())?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&json).map_err(|_| mismatch())?;

        if snapshot.session_id != session_id || snapshot.compute_checksum()? != snapshot.checksum {
            return Err(mismatch());
        }
        Ok(snapshot)
    }

    /// Session state at this snapshot, with `history` as given.
    pub fn into_state(
        self,
        history: Vec<crate::engine::types::ExecutionEvent>,
    ) -> Result<SessionState, PersistenceError> {
        Ok(SessionState {
            workflow: serde_json::from_value(self.workflow_state)?,
            agent_contexts: serde_json::from_value(self.agent_contexts)?,
            history,
        })
    }

    pub fn history_delta(&self) -> Result<Vec<crate::engine::types::ExecutionEvent>, PersistenceError> {
        Ok(serde_json::from_value(self.history.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::WorkflowSession;

    fn state() -> SessionState {
        SessionState::new(WorkflowSession::new("session_test", "write a report"))
    }

    #[test]
    fn encode_decode_verifies() {
        let snapshot = SessionSnapshot::capture("session_test", &state(), 0, None).unwrap();
        let (version, bytes) = snapshot.encode().unwrap();
        let decoded = SessionSnapshot::decode("session_test", Some(&version), &bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn version_id_is_content_address() {
        let snapshot = SessionSnapshot::capture("session_test", &state(), 0, None).unwrap();
        let (v1, _) = snapshot.encode().unwrap();
        let (v2, _) = snapshot.encode().unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 64);
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let snapshot = SessionSnapshot::capture("session_test", &state(), 0, None).unwrap();
        let (version, mut bytes) = snapshot.encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        let err = SessionSnapshot::decode("session_test", Some(&version), &bytes).unwrap_err();
        assert!(matches!(err, PersistenceError::ChecksumMismatch { .. }));
    }

    #[test]
    fn tampered_field_fails_inner_checksum() {
        let mut snapshot = SessionSnapshot::capture("session_test", &state(), 0, None).unwrap();
        snapshot.workflow_state["goal"] = serde_json::json!("something else");
        let (_, bytes) = snapshot.encode().unwrap();
        let err = SessionSnapshot::decode("session_test", None, &bytes).unwrap_err();
        assert!(matches!(err, PersistenceError::ChecksumMismatch { .. }));
    }
}
