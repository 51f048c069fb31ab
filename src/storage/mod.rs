use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// Version written into every persisted document.
pub const FORMAT_VERSION: u32 = 1;

pub const INCIDENTS_KEY: &str = "incidents";
pub const REPORTS_KEY: &str = "rca_reports";
pub const LEARNER_KEY: &str = "learner";
pub const BREAKERS_KEY: &str = "circuit_breakers";
pub const MAINTENANCE_KEY: &str = "maintenance";
pub const CHAOS_RESULTS_KEY: &str = "chaos_results";

/// Durable key-value persistence shared by every stateful component.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Writes `new` only when the current value equals `expected`
    /// (`None` meaning "absent"). Returns whether the write happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    version: u32,
    saved_at: DateTime<Utc>,
    data: T,
}

/// Load a versioned document. Extra fields are ignored; a document that no
/// longer parses is reported as a persistence failure so the caller can start empty.
pub async fn load_document<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&bytes)
        .map_err(|e| OrchestratorError::Persistence(format!("Corrupt document '{}': {}", key, e)))?;

    if envelope.version > FORMAT_VERSION {
        warn!(
            "Document '{}' has format version {} (newer than {}), reading known fields only",
            key, envelope.version, FORMAT_VERSION
        );
    }

    let data = serde_json::from_value(envelope.data)
        .map_err(|e| OrchestratorError::Persistence(format!("Unreadable document '{}': {}", key, e)))?;
    Ok(Some(data))
}

pub async fn save_document<T: Serialize>(store: &dyn StateStore, key: &str, data: &T) -> Result<()> {
    let envelope = Envelope {
        version: FORMAT_VERSION,
        saved_at: Utc::now(),
        data,
    };
    let bytes = serde_json::to_vec_pretty(&envelope)?;
    store.put(key, &bytes).await
}

/// One JSON file per key, replaced atomically through a temp file and rename.
pub struct FileStore {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir).map_err(|e| {
            OrchestratorError::Persistence(format!("Failed to create state directory {:?}: {}", state_dir, e))
        })?;
        Ok(Self {
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.state_dir.join(format!("{}.json", safe))
    }

    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::Persistence(format!("Failed to read {:?}: {}", path, e))),
        }
    }

    async fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, value)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("Failed to write {:?}: {}", temp_path, e)))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("Failed to rename to {:?}: {}", path, e)))?;
        debug!("Persisted {} bytes to {:?}", value.len(), path);
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read(&self.path_for(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(&self.path_for(key), value).await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let current = self.read(&path).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.write_atomic(&path, new).await?;
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), new.to_vec());
        Ok(true)
    }
}
