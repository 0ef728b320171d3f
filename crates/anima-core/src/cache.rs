//! Shared key-value cache: the substrate for session state and SSE replay.
//!
//! `KvStore` is the seam; the pipeline never talks to a concrete store.
//! `MemoryStore` is the in-process implementation matching the
//! single-process cooperative model: a sharded map with absolute expiry
//! instants, dropped lazily on access. The atomic increment goes through
//! the map's entry API so it is a single locked operation per key.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// String get/set with TTL, atomic increment, and list append/range.
/// Used both for session bookkeeping and for ordered SSE frame replay.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    /// Set a string value with an absolute TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()>;
    async fn delete(&self, key: &str) -> CoreResult<()>;
    /// Delete every key under a namespace prefix (session teardown).
    async fn delete_prefix(&self, prefix: &str) -> CoreResult<()>;
    /// Atomically increment a counter, refreshing its TTL. Expired or
    /// missing counters restart at 1.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> CoreResult<i64>;
    /// Append raw items to an ordered list, refreshing its TTL.
    async fn rpush(&self, key: &str, items: &[Vec<u8>], ttl: Duration) -> CoreResult<()>;
    /// Full contents of a list key, or None when absent/expired.
    async fn lrange(&self, key: &str) -> CoreResult<Option<Vec<Vec<u8>>>>;
    /// Set-if-absent with TTL. Returns true when this caller won the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool>;
}

enum Value {
    Text(String),
    Counter(i64),
    List(Vec<Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process `KvStore` backed by a `DashMap` with per-entry expiry.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Called opportunistically; correctness only
    /// needs the lazy checks on read.
    pub fn sweep(&self) {
        self.map.retain(|_, e| e.live());
    }

    fn read_live<T>(&self, key: &str, f: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        if let Some(entry) = self.map.get(key) {
            if entry.live() {
                return f(&entry.value);
            }
        }
        // Expired or missing: clean up under the shard lock.
        self.map.remove_if(key, |_, e| !e.live());
        None
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.read_live(key, |v| match v {
            Value::Text(s) => Some(s.clone()),
            Value::Counter(n) => Some(n.to_string()),
            Value::List(_) => None,
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()> {
        self.map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CoreResult<()> {
        self.map.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> CoreResult<i64> {
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: Instant::now() + ttl,
        });
        if !entry.live() {
            entry.value = Value::Counter(0);
        }
        entry.expires_at = Instant::now() + ttl;
        match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(CoreError::Cache(format!(
                "incr on non-counter key: {key}"
            ))),
        }
    }

    async fn rpush(&self, key: &str, items: &[Vec<u8>], ttl: Duration) -> CoreResult<()> {
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: Instant::now() + ttl,
        });
        if !entry.live() {
            entry.value = Value::List(Vec::new());
        }
        entry.expires_at = Instant::now() + ttl;
        match &mut entry.value {
            Value::List(list) => {
                list.extend(items.iter().cloned());
                Ok(())
            }
            _ => Err(CoreError::Cache(format!("rpush on non-list key: {key}"))),
        }
    }

    async fn lrange(&self, key: &str) -> CoreResult<Option<Vec<Vec<u8>>>> {
        Ok(self.read_live(key, |v| match v {
            Value::List(list) => Some(list.clone()),
            _ => None,
        }))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let mut won = false;
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| {
            won = true;
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            }
        });
        if !won && !entry.live() {
            // Expired lease: take it over.
            entry.value = Value::Text(value.to_string());
            entry.expires_at = Instant::now() + ttl;
            won = true;
        }
        Ok(won)
    }
}
