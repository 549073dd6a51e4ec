//! Settings Stores
//!
//! Key-value persistence for the control plane (selected location and
//! similar). Values are JSON.

use crate::ports::SettingsStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Volatile store, lost on restart
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Single JSON document on disk
///
/// The document is read once, on first access. Every `set` rewrites the whole
/// file through a temporary sibling and a rename, so a crash mid-write leaves
/// the previous version in place.
pub struct FileSettingsStore {
    path: PathBuf,
    document: Mutex<Option<Map<String, Value>>>,
}

impl FileSettingsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>, SettingsError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No settings file yet");
                return Ok(Map::new());
            }
            Err(e) => return Err(SettingsError::Io(e.to_string())),
        };

        match serde_json::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string()))? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::Parse("settings root is not an object".into())),
        }
    }

    async fn persist(&self, document: &Map<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SettingsError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, content)
            .await
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        let mut document = self.document.lock().await;
        if document.is_none() {
            *document = Some(self.load().await?);
        }
        Ok(document.as_ref().and_then(|d| d.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut document = self.document.lock().await;
        let mut updated = match document.take() {
            Some(d) => d,
            None => self.load().await?,
        };
        updated.insert(key.to_string(), value);

        let result = self.persist(&updated).await;
        *document = Some(updated);
        result
    }
}

/// Settings persistence errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(String),

    #[error("Settings parse error: {0}")]
    Parse(String),
}
