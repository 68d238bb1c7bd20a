//! Result cache for expensive tool runs
//!
//! Entries are JSON files named after a SHA-256 key derived from the input
//! file's content plus the operation parameters, so renaming or touching a
//! file does not invalidate its cached silence map. Entries older than the
//! TTL are treated as absent and removed on lookup.

use crate::error::{TagError, TagResult};
use bookmeta_common::config::CacheConfig;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Stored cache entry
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    created_at: DateTime<Utc>,
    value: serde_json::Value,
}

/// File-backed, TTL-bounded result cache
///
/// Constructed explicitly and handed to the dispatcher; there is no global instance.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Build from configuration; `None` when caching is disabled
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.resolved_dir(), Duration::from_secs(config.ttl_seconds)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// SHA-256 over the file content followed by `params`
    ///
    /// **Algorithm:**
    /// 1. Read file content in 1MB chunks on a blocking thread
    /// 2. Feed the parameter string after the content
    /// 3. Return the hex digest
    pub async fn content_key(file: &Path, params: &str) -> TagResult<String> {
        let path = file.to_path_buf();
        let params = params.to_string();

        let key = tokio::task::spawn_blocking(move || -> TagResult<String> {
            let mut input = std::fs::File::open(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("Failed to open {} for hashing: {}", path.display(), e))
            })?;

            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; 1024 * 1024];
            loop {
                let bytes_read = input.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
            hasher.update(params.as_bytes());

            Ok(format!("{:x}", hasher.finalize()))
        })
        .await
        .map_err(|e| TagError::Io(std::io::Error::other(format!("Hash task failed: {}", e))))??;

        debug!(file = %file.display(), key = %key, "Computed cache key");
        Ok(key)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Fresh entry for `key`, if any
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> TagResult<Option<T>> {
        self.get_at(key, Utc::now()).await
    }

    /// Lookup as of `now`; expired entries are removed
    pub async fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> TagResult<Option<T>> {
        let path = self.entry_path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key, error = %e, "Discarding unreadable cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        let age = (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            debug!(key = %key, age_secs = age.as_secs(), "Cache entry expired");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        debug!(key = %key, "Cache hit");
        Ok(Some(serde_json::from_value(entry.value)?))
    }

    /// Store `value` under `key`
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> TagResult<()> {
        self.put_at(key, value, Utc::now()).await
    }

    /// Store `value` as if written at `created_at`
    pub async fn put_at<T: Serialize>(&self, key: &str, value: &T, created_at: DateTime<Utc>) -> TagResult<()> {
        let entry = CacheEntry {
            created_at,
            value: serde_json::to_value(value)?,
        };
        let content = serde_json::to_vec(&entry)?;
        let dir = self.dir.clone();
        let path = self.entry_path(key);

        tokio::task::spawn_blocking(move || -> TagResult<()> {
            std::fs::create_dir_all(&dir)?;
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(&content)?;
            temp.persist(&path).map_err(|e| TagError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| TagError::Io(std::io::Error::other(format!("Cache write task failed: {}", e))))??;

        debug!(key = %key, "Stored cache entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(dir.path(), Duration::from_secs(60));
        let written = Utc::now();

        cache.put_at("k", &vec![1u32, 2, 3], written).await.unwrap();

        let fresh: Option<Vec<u32>> = cache.get_at("k", written + chrono::Duration::seconds(59)).await.unwrap();
        assert_eq!(fresh, Some(vec![1, 2, 3]));

        let stale: Option<Vec<u32>> = cache.get_at("k", written + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(stale, None);
        assert!(!dir.path().join("k.json").exists(), "Expired entry is removed");
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::new(dir.path(), Duration::from_secs(60));

        let missing: Option<String> = cache.get("nope").await.unwrap();
        assert_eq!(missing, None);

        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let corrupt: Option<String> = cache.get("bad").await.unwrap();
        assert_eq!(corrupt, None);
    }

    #[tokio::test]
    async fn test_content_key_depends_on_content_and_params() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.m4b");
        let b = dir.path().join("b.m4b");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let key_a = ResultCache::content_key(&a, "silences:2000").await.unwrap();
        let key_b = ResultCache::content_key(&b, "silences:2000").await.unwrap();
        let key_other = ResultCache::content_key(&a, "silences:500").await.unwrap();

        assert_eq!(key_a, key_b, "Key ignores the file name");
        assert_ne!(key_a, key_other);
        assert_eq!(key_a.len(), 64);
    }

    #[test]
    fn test_disabled_config() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(ResultCache::from_config(&config).is_none());
    }
}
