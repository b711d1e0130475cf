//! File-backed store
//!
//! One file per key under a base directory. File names are the hex MD5 of
//! the key so arbitrary keys stay filesystem-safe. Writes go to a temp file
//! first and are moved into place with a rename, which is atomic on the
//! filesystems we care about. A per-key RW-lock serializes writers within
//! the process; concurrent readers are fine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::Store;

/// File store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Base directory; the system temp directory when empty
    pub dir: String,
}

impl FileStoreConfig {
    /// Build from `STORE_FILE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            dir: std::env::var("STORE_FILE_DIR").unwrap_or_default(),
        }
    }
}

/// One file per key with atomic replacement on write.
pub struct FileStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl FileStore {
    pub async fn new(config: FileStoreConfig) -> Result<Self> {
        let dir = if config.dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(config.dir)
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::config(format!("failed to create store dir: {}", e)))?;

        debug!(dir = %dir.display(), "file store ready");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = md5::compute(key.as_bytes());
        self.dir.join(format!("{:x}", digest))
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[async_trait]
impl Store for FileStore {
    async fn has(&self, key: &str) -> bool {
        let lock = self.lock_for(key);
        let _guard = lock.read().await;
        fs::metadata(self.path_for(key)).await.is_ok()
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.write().await;

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let lock = self.lock_for(key);
        let _guard = lock.read().await;

        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.write().await;

        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
