//! Key/value store collaborator (spec §6): ClientLocation entries, the
//! persisted mapping lookup cache, id-generator sequence counters, and an
//! optional distributed lock for id allocation all go through this trait.
//! The core never assumes a particular backend.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value at key {0:?} is not the expected type")]
    WrongType(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.incr_by(key, 1).await
    }
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Sets only if `key` does not already hold a value; returns whether it set.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Swaps the value only if the current value equals `expected` (`None`
    /// meaning "key must be absent"); returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> StoreResult<bool>;

    async fn list_push(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>>;

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()>;
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
}

enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory `KvStore`, used for standalone nodes and in tests; a Redis
/// implementation is the production "redis" storage kind from spec §6.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        match &entry.value {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.live_bytes(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key.to_string(), Entry { value: Value::Bytes(value), expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live_bytes(key).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Bytes(0i64.to_be_bytes().to_vec()), expires_at: None });

        let current = match &entry.value {
            Value::Bytes(b) if b.len() == 8 => i64::from_be_bytes(b[..8].try_into().unwrap()),
            Value::Bytes(_) => return Err(StoreError::WrongType(key.to_string())),
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        let next = current + delta;
        entry.value = Value::Bytes(next.to_be_bytes().to_vec());
        Ok(next)
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<bool> {
        let now = Instant::now();
        if let Some(existing) = self.entries.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        let expires_at = ttl.map(|d| now + d);
        self.entries.insert(key.to_string(), Entry { value: Value::Bytes(value), expires_at });
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> StoreResult<bool> {
        let current = self.live_bytes(key);
        if current != expected {
            return Ok(false);
        }
        self.entries.insert(key.to_string(), Entry { value: Value::Bytes(new), expires_at: None });
        Ok(true)
    }

    async fn list_push(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::List(VecDeque::new()), expires_at: None });
        match &mut entry.value {
            Value::List(list) => list.push_back(value),
            _ => return Err(StoreError::WrongType(key.to_string())),
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        let entry = match self.entries.get(key) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let list = match &entry.value {
            Value::List(list) => list,
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        let len = list.len() as isize;
        let normalize = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = normalize(start) as usize;
        let stop = (normalize(stop) + 1).max(0) as usize;
        Ok(list.iter().skip(start).take(stop.saturating_sub(start)).cloned().collect())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Hash(HashMap::new()), expires_at: None });
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value);
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        let entry = match self.entries.get(key) {
            Some(e) => e,
            None => return Ok(None),
        };
        match &entry.value {
            Value::Hash(map) => Ok(map.get(field).cloned()),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut entry = match self.entries.get_mut(key) {
            Some(e) => e,
            None => return Ok(false),
        };
        match &mut entry.value {
            Value::Hash(map) => Ok(map.remove(field).is_some()),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entry = match self.entries.get_mut(key) {
            Some(e) => e,
            None => return Ok(false),
        };
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_round_trips() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), Some(Duration::from_secs(1))).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_only_sets_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", b"a".to_vec(), None).await.unwrap());
        assert!(!store.set_nx("k", b"b".to_vec(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn compare_and_swap_only_on_match() {
        let store = MemoryStore::new();
        store.set("k", b"a".to_vec(), None).await.unwrap();
        assert!(!store.compare_and_swap("k", Some(b"wrong".to_vec()), b"b".to_vec()).await.unwrap());
        assert!(store.compare_and_swap("k", Some(b"a".to_vec()), b"b".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn incr_by_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr_by("counter", 5).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn list_and_hash_ops() {
        let store = MemoryStore::new();
        store.list_push("l", b"1".to_vec()).await.unwrap();
        store.list_push("l", b"2".to_vec()).await.unwrap();
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);

        store.hash_set("h", "f", b"v".to_vec()).await.unwrap();
        assert_eq!(store.hash_get("h", "f").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.hash_delete("h", "f").await.unwrap());
        assert_eq!(store.hash_get("h", "f").await.unwrap(), None);
    }
}
