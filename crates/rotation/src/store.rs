//! Job persistence
//!
//! The host supplies a [`Store`]: a key-value view with linearizable
//! per-key reads and writes and JSON values. [`MemoryStore`] is the
//! in-process implementation used by tests and single-node setups.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// Key-value storage for job records
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Value at `key`, if any
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Write `value` at `key`, replacing any previous value
    async fn put(&self, key: &str, value: &Value) -> StorageResult<()>;

    /// Remove `key`; removing a missing key succeeds
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys starting with `prefix`, in ascending order
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// In-memory [`Store`] on a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` and `delete` fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every `get` and `list` fail until switched back
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value at `key` without going through the trait
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::backend(format!("simulated {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.check(&self.fail_reads, "read")?;
        Ok(self.snapshot(key))
    }

    async fn put(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.check(&self.fail_writes, "write")?;
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check(&self.fail_writes, "delete")?;
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check(&self.fail_reads, "list")?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.put("rotation/db/b", &json!({"v": 2})).await.unwrap();
        store.put("rotation/db/a", &json!({"v": 1})).await.unwrap();
        store.put("other/x", &json!(null)).await.unwrap();

        assert_eq!(store.get("rotation/db/a").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(
            store.list("rotation/").await.unwrap(),
            ["rotation/db/a", "rotation/db/b"]
        );

        store.delete("rotation/db/a").await.unwrap();
        store.delete("rotation/db/a").await.unwrap();
        assert_eq!(store.get("rotation/db/a").await.unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.put("k", &json!(1)).await,
            Err(StorageError::Backend { .. })
        ));
        assert!(store.delete("k").await.is_err());
        assert!(store.is_empty());

        store.set_fail_writes(false);
        store.set_fail_reads(true);
        store.put("k", &json!(1)).await.unwrap();
        assert!(store.list("").await.is_err());
        assert_eq!(store.snapshot("k"), Some(json!(1)));
    }
}
