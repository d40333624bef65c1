use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

pub const ACTIVE_KEY: &str = "progress_active";
pub const COMPLETED_KEY: &str = "progress_completed";
pub const SYNC_STATE_KEY: &str = "sync_state";
pub const SETTINGS_KEY: &str = "settings";

/// Durable key-value storage holding one string blob per logical key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
}

/// Stores each key as a file under `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalFsKvStore {
    base_dir: PathBuf,
}

impl LocalFsKvStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn key_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            anyhow::bail!("invalid storage key: {key:?}");
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl KvStore for LocalFsKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.key_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read: {}", path.display())),
        }
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let path = self.key_path(key)?;
        write_atomic(&path, value.as_bytes())
            .await
            .with_context(|| format!("write {key}"))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.lock().await.insert(key.to_owned(), value);
        Ok(())
    }
}
