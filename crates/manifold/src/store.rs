//! Cache store abstraction.
//!
//! Persistence of cache entries is delegated to a pluggable key-value store.
//! A [`StoreError::Miss`] sentinel distinguishes absence from backend
//! failure so the typed cache layer can treat the two differently.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Failures from a cache store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is not present. Not a failure.
    #[error("cache miss")]
    Miss,
    /// The backend failed; the caller decides whether to degrade or abort.
    #[error("cache store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_miss(&self) -> bool {
        matches!(self, StoreError::Miss)
    }
}

/// Pluggable key-value store behind the cache layer.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the raw bytes at a key, or [`StoreError::Miss`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store bytes at a key; `ttl` of `None` means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-process store. The default backend for single-instance deployments
/// and the backend every test runs against.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    return Err(StoreError::Miss);
                }
                Ok(entry.value.clone())
            }
            None => Err(StoreError::Miss),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .remove(key);
        Ok(())
    }
}
