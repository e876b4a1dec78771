use super::{EventBus, LocalBus};
use crate::events::{Room, ServerEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL_PREFIX: &str = "room-events:";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct Envelope {
    room: String,
    event: ServerEvent,
}

/// Cross-replica fan-out over Redis pub/sub.
///
/// `publish` goes only through Redis; the listener started by
/// [`RedisBus::connect`] delivers every message, including this replica's
/// own, to local subscribers. Each session therefore sees one copy.
pub struct RedisBus {
    local: Arc<LocalBus>,
    conn: ConnectionManager,
    listener: JoinHandle<()>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let local = Arc::new(LocalBus::new());
        let listener = tokio::spawn(listen(client, Arc::clone(&local)));
        Ok(Self { local, conn, listener })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(client: redis::Client, local: Arc<LocalBus>) {
    let pattern = format!("{CHANNEL_PREFIX}*");
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    warn!(error = %e, "room event subscription failed");
                } else {
                    info!(%pattern, "listening for room events");
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "unreadable room event payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<Envelope>(&payload) {
                            Ok(envelope) => {
                                local.deliver(&envelope.room, envelope.event);
                            }
                            Err(e) => warn!(error = %e, "malformed room event dropped"),
                        }
                    }
                    warn!("room event stream ended");
                }
            }
            Err(e) => warn!(error = %e, "room event listener cannot connect"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, room: &Room, event: ServerEvent) {
        let channel = room.channel();
        let envelope = Envelope {
            room: channel.clone(),
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(%room, error = %e, "cannot encode room event");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let published: redis::RedisResult<i64> =
            conn.publish(format!("{CHANNEL_PREFIX}{channel}"), payload).await;
        match published {
            Ok(replicas) => debug!(%room, replicas, "published"),
            Err(e) => warn!(%room, error = %e, "room event lost"),
        }
    }

    fn subscribe(&self, room: &Room) -> broadcast::Receiver<ServerEvent> {
        self.local.subscribe_channel(&room.channel())
    }
}
