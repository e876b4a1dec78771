//! Presence registry: which users are in a project or file room.
//!
//! Membership lives in store sets keyed by room, so every replica sees the
//! same members. Sets make duplicate joins and leaves harmless.
//!
//! Members are user ids, not connections. A user with two connections in a
//! room is one member, and the first of them to leave or disconnect removes
//! the user: the other connection still receives room events, but lists and
//! lock transfers no longer see the user until it joins again.

use crate::broadcast::EventBus;
use crate::events::{FileMember, Member, Room, ServerEvent};
use crate::store::{StateStore, StoreResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct PresenceRegistry {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventBus>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn StateStore>, events: Arc<dyn EventBus>) -> Self {
        Self { store, events }
    }

    /// Add `user_id` to the room, announce it, and return the members after
    /// the join so the caller can send the joining session a snapshot.
    pub async fn join(
        &self,
        room: &Room,
        user_id: &str,
        connection_id: &str,
    ) -> StoreResult<BTreeSet<String>> {
        self.store.set_add(&room.presence_key(), user_id).await?;
        debug!(%room, user_id, connection_id, "joined");
        self.events
            .publish(room, joined_event(room, user_id, connection_id))
            .await;
        self.list(room).await
    }

    /// Remove `user_id` from the room and announce it. This removes the user,
    /// whichever of its connections is leaving.
    pub async fn leave(&self, room: &Room, user_id: &str, connection_id: &str) -> StoreResult<()> {
        self.store.set_remove(&room.presence_key(), user_id).await?;
        debug!(%room, user_id, connection_id, "left");
        self.events
            .publish(room, left_event(room, user_id, connection_id))
            .await;
        Ok(())
    }

    pub async fn list(&self, room: &Room) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .store
            .set_members(&room.presence_key())
            .await?
            .into_iter()
            .collect())
    }

    pub async fn is_present(&self, room: &Room, user_id: &str) -> StoreResult<bool> {
        self.store.set_contains(&room.presence_key(), user_id).await
    }
}

fn joined_event(room: &Room, user_id: &str, connection_id: &str) -> ServerEvent {
    match room {
        Room::Project(_) => ServerEvent::UserJoinedProject(Member {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
        }),
        Room::File { file_path, .. } => ServerEvent::UserJoinedFile(FileMember {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            file_path: file_path.clone(),
        }),
    }
}

fn left_event(room: &Room, user_id: &str, connection_id: &str) -> ServerEvent {
    match room {
        Room::Project(_) => ServerEvent::UserLeftProject(Member {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
        }),
        Room::File { file_path, .. } => ServerEvent::UserLeftFile(FileMember {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            file_path: file_path.clone(),
        }),
    }
}
