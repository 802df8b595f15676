use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

/// Hands each session a writable directory for step artifacts.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn allocate(&self, session_id: &str) -> Result<PathBuf>;
}

/// Allocates `<base>/<session_id>/` with an `agent_outputs/` subdirectory.
pub struct DirWorkspaceProvider {
    base_dir: PathBuf,
}

impl DirWorkspaceProvider {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl WorkspaceProvider for DirWorkspaceProvider {
    async fn allocate(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.base_dir.join(session_id);
        tokio::fs::create_dir_all(dir.join("agent_outputs"))
            .await
            .with_context(|| format!("Failed to create workspace: {}", dir.display()))?;
        Ok(dir)
    }
}
