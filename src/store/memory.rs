//! In-process store for a single replica and for tests.

use super::{StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Mutex-guarded map with lazy TTL expiry.
///
/// Each operation runs under one lock acquisition, which makes the
/// conditional primitives atomic within the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop `key` if it has expired, then return the live entry.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn text_of(entry: Option<&mut Entry>, key: &str) -> StoreResult<Option<String>> {
    match entry {
        None => Ok(None),
        Some(Entry { value: Value::Text(s), .. }) => Ok(Some(s.clone())),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries();
        text_of(live(&mut entries, key, Instant::now()), key)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries();
        let current = text_of(live(&mut entries, key, now), key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.entries();
        let current = text_of(live(&mut entries, key, Instant::now()), key)?;
        if current.as_deref() != Some(expected) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries();
        let entry = live(&mut entries, key, Instant::now());
        match entry {
            Some(Entry { value: Value::Set(set), .. }) => {
                set.insert(member.to_string());
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(HashSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries();
        let now_empty = match live(&mut entries, key, Instant::now()) {
            Some(Entry { value: Value::Set(set), .. }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => false,
        };
        // Empty sets vanish, as they do in Redis.
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<HashSet<String>> {
        let mut entries = self.entries();
        match live(&mut entries, key, Instant::now()) {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashSet::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.entries();
        match live(&mut entries, key, Instant::now()) {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}
