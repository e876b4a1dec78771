use super::{EventBus, ROOM_CAPACITY};
use crate::events::{Room, ServerEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// In-process fan-out, one broadcast channel per room.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `event` to local subscribers of `channel`. Returns the number of
    /// receivers reached.
    pub(crate) fn deliver(&self, channel: &str, event: ServerEvent) -> usize {
        let sender = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned();
        let Some(sender) = sender else {
            return 0;
        };
        match sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                // Nobody listens any more; drop the channel unless someone
                // subscribed in between.
                let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
                if channels.get(channel).is_some_and(|tx| tx.receiver_count() == 0) {
                    channels.remove(channel);
                    debug!(channel, "removed idle room channel");
                }
                0
            }
        }
    }

    pub(crate) fn subscribe_channel(&self, channel: &str) -> broadcast::Receiver<ServerEvent> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Number of rooms with a live channel.
    pub fn room_count(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, room: &Room, event: ServerEvent) {
        let reached = self.deliver(&room.channel(), event);
        debug!(%room, reached, "published");
    }

    fn subscribe(&self, room: &Room) -> broadcast::Receiver<ServerEvent> {
        self.subscribe_channel(&room.channel())
    }
}
