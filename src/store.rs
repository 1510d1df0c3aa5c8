//! In-memory byte-keyed store.
//!
//! The map owns its bytes: values are copied in on set and cloned out on
//! get, so callers never observe the store's internal buffers.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{Result, RustCacheError};

/// Shared key/value map behind a read/write lock, which serializes mutation
/// across the server's connection tasks.
#[derive(Debug, Default)]
pub struct CacheMap {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl CacheMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `value` under a copy of `key`.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Returns the bytes last set for `key`, or `KeyNotSet`.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let data = self.data.read().await;
        data.get(key)
            .cloned()
            .ok_or_else(|| RustCacheError::KeyNotSet(String::from_utf8_lossy(key).into_owned()))
    }

    /// Removes `key`; removing an absent key succeeds.
    pub async fn del(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    /// Drops every entry, leaving the store as fresh.
    pub async fn clear(&self) {
        self.data.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}
