//! Room-addressed fan-out of server events.
//!
//! Delivery is at-most-once: a session that is not subscribed when an event
//! is published never sees it, and lagging subscribers drop events.

mod local;
mod redis;

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

use crate::events::{Room, ServerEvent};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Per-room buffered events before a slow subscriber starts lagging.
pub const ROOM_CAPACITY: usize = 256;

/// Publish/subscribe interface hiding the backing transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `event` to every session subscribed to `room`.
    ///
    /// Failures are logged by the transport; callers never retry.
    async fn publish(&self, room: &Room, event: ServerEvent);

    /// Subscribe to events published to `room` from now on.
    fn subscribe(&self, room: &Room) -> broadcast::Receiver<ServerEvent>;
}
