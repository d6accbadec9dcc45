//! Persistent byte store for cached assets and synthesis responses
//!
//! Entries live under the platform cache directory:
//!
//! - macOS: `~/Library/Caches/lexi-narration/`
//! - Linux: `~/.cache/lexi-narration/`
//! - Windows: `%LOCALAPPDATA%/lexi-narration/`
//!
//! File names are the SHA-256 of the cache key, so arbitrary keys (storage
//! paths, whole chunk texts) map to safe, fixed-length names.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur in the cache layers
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache directory not accessible: {0}")]
    DirectoryError(String),
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("HTTP {status} fetching {path}")]
    Status { status: u16, path: String },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Bytes read back from disk with their write time
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub bytes: Vec<u8>,
    pub stored_at: SystemTime,
}

/// Directory of hashed cache entries
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(DiskStore { root })
    }

    /// Get the platform-specific cache directory
    pub fn default_dir() -> Result<PathBuf, CacheError> {
        let cache_dir = dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .ok_or_else(|| {
                CacheError::DirectoryError("Cannot determine cache directory".to_string())
            })?;

        Ok(cache_dir.join("lexi-narration"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.root.join(name)
    }

    pub async fn read(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored_at = tokio::fs::metadata(&path).await?.modified()?;

        Ok(Some(StoredEntry { bytes, stored_at }))
    }

    /// Write through a temporary file so readers never see a partial entry
    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every entry, keeping the directory
    pub async fn clear(&self) -> Result<(), CacheError> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Get total disk usage of the store
    pub fn total_size(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;

        if self.root.exists() {
            for entry in std::fs::read_dir(&self.root)? {
                let metadata = entry?.metadata()?;
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}
