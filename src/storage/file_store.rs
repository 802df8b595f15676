use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PersistenceError;

use super::versioned::{Backend, Manifest, VersionedStore};

/// Directory-backed session store.
///
/// Layout per session:
/// `<base>/<session_id>/manifest.json`, `versions/<version_id>.snap.gz`,
/// `working.snap.gz`. Every file is written to a temp path and renamed.
pub type FileSessionStore = VersionedStore<DirBackend>;

impl VersionedStore<DirBackend> {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self::with_backend(DirBackend {
            base_dir: base_dir.as_ref().to_path_buf(),
        })
    }
}

pub struct DirBackend {
    base_dir: PathBuf,
}

impl DirBackend {
    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    fn manifest_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("manifest.json")
    }

    fn version_path(&self, session_id: &str, version_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("versions")
            .join(format!("{}.snap.gz", version_id))
    }

    fn working_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("working.snap.gz")
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl Backend for DirBackend {
    async fn load_manifest(&self, session_id: &str) -> Result<Option<Manifest>, PersistenceError> {
        match read_optional(&self.manifest_path(session_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.manifest_path(&manifest.session_id), &data).await
    }

    async fn load_version(
        &self,
        session_id: &str,
        version_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.version_path(session_id, version_id)).await
    }

    async fn save_version(
        &self,
        session_id: &str,
        version_id: &str,
        bytes: &[u8],
    ) -> Result<(), PersistenceError> {
        write_atomic(&self.version_path(session_id, version_id), bytes).await
    }

    async fn load_working(&self, session_id: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.working_path(session_id)).await
    }

    async fn save_working(&self, session_id: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        write_atomic(&self.working_path(session_id), bytes).await
    }

    async fn session_ids(&self) -> Result<Vec<String>, PersistenceError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.join("manifest.json").exists()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
