//! Caller-side persistence of [`SourceState`], one entry per source key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::ingest::types::SourceState;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Missing state loads as empty.
    async fn load(&self, key: &str) -> Result<SourceState>;
    async fn save(&self, key: &str, state: &SourceState) -> Result<()>;
}

/// Pretty JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, key: &str) -> Result<SourceState> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourceState::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading state {}", path.display()));
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                // Starting empty re-emits the current window once.
                tracing::warn!(key, path = %path.display(), error = %e, "corrupt state file, starting empty");
                Ok(SourceState::default())
            }
        }
    }

    async fn save(&self, key: &str, state: &SourceState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state dir {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state).context("serializing state")?;
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

/// In-process store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, SourceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: &str, state: SourceState) {
        self.inner.lock().await.insert(key.to_string(), state);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<SourceState> {
        Ok(self.inner.lock().await.get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &str, state: &SourceState) -> Result<()> {
        self.inner.lock().await.insert(key.to_string(), state.clone());
        Ok(())
    }
}
