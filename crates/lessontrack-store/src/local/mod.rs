//! Device-local, identity-less key/value area.
//!
//! The ephemeral adapter only needs string get/set/remove, so anything that
//! can hold string pairs can back it: a SQLite file ([`KvStore`]) on a real
//! device, or a process-lifetime map ([`MemoryStorage`]).

mod kv;

pub use kv::KvStore;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreResult;

/// String key/value persistence addressed by key.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Read the raw value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove `key`, returning `true` if it existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;
}

/// In-process key/value area; everything is lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(storage.len(), 1);

        assert!(storage.remove("k").await.unwrap());
        assert!(storage.get("k").await.unwrap().is_none());
    }
}
