//! Shared state store client.
//!
//! Every replica reads and writes presence sets and lock records through a
//! [`StateStore`]. The store is authoritative; nothing here caches its state.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors from the shared state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A key holds a value of an unexpected type.
    #[error("wrong value type at key {0}")]
    WrongType(String),

    /// Conditional writes on a key kept losing races.
    #[error("key {0} is too contended, try again")]
    Contended(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value store with atomic conditional writes, TTL and string sets.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend identifier for logs.
    fn backend(&self) -> &'static str;

    /// Read a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically write `value` with `ttl` only if the current value equals
    /// `expected` (`None` meaning the key must be absent).
    ///
    /// Returns `true` if the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Atomically delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Unconditionally delete a key.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<HashSet<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Enumerate live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Drop expired entries eagerly. Backends with native expiry do nothing.
    async fn sweep_expired(&self) -> usize {
        0
    }
}

/// Keyspace conventions shared by every replica.
pub mod keys {
    /// Members of a project room.
    pub fn project_presence(project_id: &str) -> String {
        format!("presence:{project_id}")
    }

    /// Members of a file room.
    pub fn file_presence(project_id: &str, file_path: &str) -> String {
        format!("presence:{project_id}:{file_path}")
    }

    /// Lock record for one file.
    pub fn lock(project_id: &str, file_path: &str) -> String {
        format!("lock:{project_id}:{file_path}")
    }

    /// Prefix shared by every lock in a project.
    pub fn project_locks_prefix(project_id: &str) -> String {
        format!("lock:{project_id}:")
    }

    /// Lock keys a user has acquired; may contain stale entries.
    pub fn held_locks(user_id: &str) -> String {
        format!("locks-held:{user_id}")
    }
}
