//! StateStore adapters for resilience patterns
//!
//! An in-memory store for tests and single-process use, and a file-backed
//! store that keeps one JSON document per key so state survives restarts.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use conduit_core::{ConduitError, ConduitResult};

use super::StateStore;

/// StateStore implementation backed by a map
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(&self, key: &str) -> ConduitResult<Option<Value>> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn set_state(&self, key: &str, state: Value) -> ConduitResult<()> {
        self.documents.write().await.insert(key.to_string(), state);
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> ConduitResult<()> {
        self.documents.write().await.remove(key);
        Ok(())
    }
}

/// StateStore implementation writing one JSON file per key
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store documents under `root`, created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory documents are stored in
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_state(&self, key: &str) -> ConduitResult<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                trace!("Read {} bytes of state for {} from {}", bytes.len(), key, path.display());
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConduitError::StateStore(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set_state(&self, key: &str, state: Value) -> ConduitResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(key);
        let temp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&state)?;

        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &path).await?;
        debug!("Persisted state for {} to {}", key, path.display());
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> ConduitResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
