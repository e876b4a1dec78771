//! Per-file exclusive locks with TTL and voluntary transfer.
//!
//! A resource is `Unlocked` when no record exists at its key and
//! `Locked(holder)` otherwise. Every transition is a single conditional write
//! against the value that was read, so concurrent replicas serialize on the
//! store and no process-local mutex is involved. A write that loses the race
//! re-reads and decides again.
//!
//! Records that cannot be decoded are treated as absent: the next acquire
//! overwrites them and release/transfer ignore them.

use crate::broadcast::EventBus;
use crate::events::{FileLocked, FilePath, LockRequested, Room, ServerEvent};
use crate::store::{keys, StateStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Default lifetime of a lock since its last write.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

/// Conditional-write attempts before giving up on a contended key.
const MAX_ATTEMPTS: usize = 16;

/// A lockable file. `file_path` is expected in canonical form
/// ([`crate::files::canonical_path`]); sessions rewrite client paths before
/// building resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub project_id: String,
    pub file_path: String,
}

impl Resource {
    pub fn new(project_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            file_path: file_path.into(),
        }
    }

    pub fn key(&self) -> String {
        keys::lock(&self.project_id, &self.file_path)
    }

    pub fn room(&self) -> Room {
        Room::file(&self.project_id, &self.file_path)
    }
}

/// Stored lock value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub holder_user_id: String,
    pub project_id: String,
    pub file_path: String,
    /// Unix milliseconds; informational, the store TTL is authoritative.
    pub expires_at: u64,
}

impl LockRecord {
    fn new(resource: &Resource, holder: &str, ttl: Duration) -> Self {
        let expires_at = SystemTime::now()
            .checked_add(ttl)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            holder_user_id: holder.to_string(),
            project_id: resource.project_id.clone(),
            file_path: resource.file_path.clone(),
            expires_at,
        }
    }

    fn encode(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a stored value; anything unreadable reads as no lock.
    fn decode(key: &str, raw: &str) -> Option<Self> {
        match serde_json::from_str::<LockRecord>(raw) {
            Ok(record) if !record.holder_user_id.is_empty() => Some(record),
            Ok(_) => {
                warn!(key, "lock record without holder treated as unlocked");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "corrupt lock record treated as unlocked");
                None
            }
        }
    }

    fn resource(&self) -> Resource {
        Resource::new(&self.project_id, &self.file_path)
    }
}

/// Result of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the lock; `renewed` if it already did.
    Acquired { renewed: bool },
    /// Another user holds the lock.
    HeldBy(String),
}

/// Why a transfer was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDenial {
    NotHolder,
    TargetNotConnected,
    NoLock,
}

impl TransferDenial {
    pub fn reason(&self) -> &'static str {
        match self {
            TransferDenial::NotHolder => "not holder",
            TransferDenial::TargetNotConnected => "target not connected",
            TransferDenial::NoLock => "no lock to transfer",
        }
    }
}

impl fmt::Display for TransferDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Lock manager shared by all sessions of a replica.
pub struct LockManager {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventBus>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<dyn EventBus>, ttl: Duration) -> Self {
        Self { store, events, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the current raw value and its decoded record.
    async fn read(&self, key: &str) -> StoreResult<(Option<String>, Option<LockRecord>)> {
        let raw = self.store.get(key).await?;
        let record = raw.as_deref().and_then(|r| LockRecord::decode(key, r));
        Ok((raw, record))
    }

    /// Current holder of `resource`, if any.
    pub async fn holder(&self, resource: &Resource) -> StoreResult<Option<String>> {
        let (_, record) = self.read(&resource.key()).await?;
        Ok(record.map(|r| r.holder_user_id))
    }

    /// Take the lock, or renew it when `user_id` already holds it.
    pub async fn acquire(&self, resource: &Resource, user_id: &str) -> StoreResult<AcquireOutcome> {
        let key = resource.key();
        let mut holder = None;
        for _ in 0..MAX_ATTEMPTS {
            let (raw, record) = self.read(&key).await?;
            let renewed = match record {
                Some(r) if r.holder_user_id != user_id => return Ok(AcquireOutcome::HeldBy(r.holder_user_id)),
                Some(r) => {
                    holder = Some(r.holder_user_id);
                    true
                }
                None => false,
            };
            let next = LockRecord::new(resource, user_id, self.ttl).encode();
            if self
                .store
                .compare_and_set(&key, raw.as_deref(), &next, self.ttl)
                .await?
            {
                self.index_add(user_id, &key).await;
                debug!(key = %key, user_id, renewed, "lock acquired");
                self.events
                    .publish(
                        &resource.room(),
                        ServerEvent::FileLocked(FileLocked {
                            file_path: resource.file_path.clone(),
                            user_id: user_id.to_string(),
                        }),
                    )
                    .await;
                return Ok(AcquireOutcome::Acquired { renewed });
            }
        }
        // The key kept changing under us; report whoever holds it now.
        let current = self.holder(resource).await?.or(holder);
        warn!(key = %key, user_id, "lock acquire gave up under contention");
        match current {
            Some(h) if h == user_id => Ok(AcquireOutcome::Acquired { renewed: true }),
            Some(h) => Ok(AcquireOutcome::HeldBy(h)),
            None => Err(StoreError::Contended(key)),
        }
    }

    /// Release the lock if `user_id` holds it. Returns whether anything was
    /// released; a non-holder's call changes nothing and emits nothing.
    pub async fn release(&self, resource: &Resource, user_id: &str) -> StoreResult<bool> {
        let key = resource.key();
        let (raw, record) = self.read(&key).await?;
        let (Some(raw), Some(record)) = (raw, record) else {
            return Ok(false);
        };
        if record.holder_user_id != user_id {
            return Ok(false);
        }
        self.delete_and_announce(&key, &raw, &record).await
    }

    async fn delete_and_announce(&self, key: &str, raw: &str, record: &LockRecord) -> StoreResult<bool> {
        if !self.store.compare_and_delete(key, raw).await? {
            // Renewed, transferred or expired since the read; nothing of ours
            // to release.
            return Ok(false);
        }
        self.index_remove(&record.holder_user_id, key).await;
        debug!(key, user_id = %record.holder_user_id, "lock released");
        self.events
            .publish(
                &Room::file(&record.project_id, &record.file_path),
                ServerEvent::FileUnlocked(FilePath {
                    file_path: record.file_path.clone(),
                }),
            )
            .await;
        Ok(true)
    }

    /// Hand the lock from `from_user_id` to `to_user_id`, who must be present
    /// in the file's room.
    pub async fn transfer(
        &self,
        resource: &Resource,
        from_user_id: &str,
        to_user_id: &str,
    ) -> StoreResult<Result<(), TransferDenial>> {
        let key = resource.key();
        for _ in 0..MAX_ATTEMPTS {
            let (raw, record) = self.read(&key).await?;
            let (Some(raw), Some(record)) = (raw, record) else {
                return Ok(Err(TransferDenial::NoLock));
            };
            if record.holder_user_id != from_user_id {
                return Ok(Err(TransferDenial::NotHolder));
            }
            if !self
                .store
                .set_contains(&resource.room().presence_key(), to_user_id)
                .await?
            {
                return Ok(Err(TransferDenial::TargetNotConnected));
            }
            let next = LockRecord::new(resource, to_user_id, self.ttl).encode();
            if self
                .store
                .compare_and_set(&key, Some(&raw), &next, self.ttl)
                .await?
            {
                self.index_remove(from_user_id, &key).await;
                self.index_add(to_user_id, &key).await;
                info!(key = %key, from = from_user_id, to = to_user_id, "lock transferred");
                self.events
                    .publish(
                        &resource.room(),
                        ServerEvent::FileLocked(FileLocked {
                            file_path: resource.file_path.clone(),
                            user_id: to_user_id.to_string(),
                        }),
                    )
                    .await;
                return Ok(Ok(()));
            }
        }
        // Lost every race: the holder renewed or changed each time.
        Ok(Err(TransferDenial::NotHolder))
    }

    /// Ask the current holder to hand over the lock. Notification only.
    pub async fn request_transfer(&self, resource: &Resource, requester_id: &str) {
        self.events
            .publish(
                &resource.room(),
                ServerEvent::FileLockRequested(LockRequested {
                    file_path: resource.file_path.clone(),
                    requested_by: requester_id.to_string(),
                }),
            )
            .await;
    }

    /// Current locks of a project as `file_path -> holder`.
    pub async fn project_locks(&self, project_id: &str) -> StoreResult<BTreeMap<String, String>> {
        let mut locks = BTreeMap::new();
        for key in self
            .store
            .keys_with_prefix(&keys::project_locks_prefix(project_id))
            .await?
        {
            let (_, record) = self.read(&key).await?;
            if let Some(record) = record {
                locks.insert(record.file_path, record.holder_user_id);
            }
        }
        Ok(locks)
    }

    /// Release every lock `user_id` holds, touching only the locks indexed
    /// for that user. Returns the released resources.
    pub async fn release_all_held_by(&self, user_id: &str) -> StoreResult<Vec<Resource>> {
        let index = keys::held_locks(user_id);
        let mut released = Vec::new();
        for key in self.store.set_members(&index).await? {
            let (raw, record) = self.read(&key).await?;
            match (raw, record) {
                (Some(raw), Some(record)) if record.holder_user_id == user_id => {
                    if self.delete_and_announce(&key, &raw, &record).await? {
                        released.push(record.resource());
                    }
                }
                // Expired, transferred away or unreadable: just forget it.
                _ => self.store.set_remove(&index, &key).await?,
            }
        }
        if !released.is_empty() {
            info!(user_id, count = released.len(), "released locks of departed user");
        }
        Ok(released)
    }

    async fn index_add(&self, user_id: &str, key: &str) {
        if let Err(e) = self.store.set_add(&keys::held_locks(user_id), key).await {
            warn!(user_id, key, error = %e, "lock index update failed");
        }
    }

    async fn index_remove(&self, user_id: &str, key: &str) {
        if let Err(e) = self.store.set_remove(&keys::held_locks(user_id), key).await {
            warn!(user_id, key, error = %e, "lock index update failed");
        }
    }
}
