//! Local directory treated as a bucket

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::ObjectStore;
use crate::error::{PipelineError, Result};

pub struct LocalStore {
    root: PathBuf,
    root_uri: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_uri = root.display().to_string();
        Self { root, root_uri }
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn root_uri(&self) -> &str {
        &self.root_uri
    }

    /// A missing root lists as empty
    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let keys = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.is_dir() {
                return Ok(Vec::new());
            }

            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(true) {
                let entry = entry.map_err(|e| {
                    PipelineError::storage(format!("Failed to walk {}: {}", root.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(key) = relative_key(&root, entry.path()) {
                    if key.starts_with(&prefix) {
                        keys.push(key);
                    }
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| PipelineError::storage(format!("Directory listing task failed: {}", e)))??;

        debug!("Found {} files under {}", keys.len(), self.root_uri);
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::storage(format!("Failed to read {}: {}", path.display(), e)))
    }
}
