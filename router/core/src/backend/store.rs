//! Persistent Stores
//!
//! [`PersistentStore`] implementations for the Cold cache tier.
//!
//! - [`InMemoryStore`]: process-local map, the default when nothing durable is configured
//! - [`FileStore`]: one file per key under a directory
//!
//! # File Format
//!
//! ```text
//! +----------------------+---------------------------+
//! | Expires (8)          | Value (variable)          |
//! | big-endian u64 ms    | bytes as written          |
//! +----------------------+---------------------------+
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::traits::{PersistentStore, StoreError};

/// Size of the expiry header in [`FileStore`] files
const EXPIRY_HEADER: usize = 8;

// ============================================================================
// In-memory
// ============================================================================

/// Map-backed store with TTL
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn write(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), (bytes.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// File-backed
// ============================================================================

/// Directory-backed store
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Store files under `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location under the user cache directory
    #[must_use]
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|p| p.join("inference-router").join("cold"))
    }

    /// Directory holding the files
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe = key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if safe && !key.is_empty() {
            self.root.join(key)
        } else {
            self.root.join(format!("x{}", hex::encode(key.as_bytes())))
        }
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((header, value)) = data.split_first_chunk::<EXPIRY_HEADER>() else {
            return Err(StoreError::Invalid(format!(
                "{} is shorter than its header",
                path.display()
            )));
        };
        if u64::from_be_bytes(*header) <= unix_millis(SystemTime::now()) {
            self.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(value.to_vec()))
    }

    async fn write(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let expires = unix_millis(SystemTime::now() + ttl);
        let mut data = Vec::with_capacity(EXPIRY_HEADER + bytes.len());
        data.extend_from_slice(&expires.to_be_bytes());
        data.extend_from_slice(bytes);

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
