//! Relay transport: a uniform publish/subscribe surface over several relays
//!
//! [`RelayClient`] talks to a single relay; [`RelayPool`] fans out over the
//! configured relay set, resolves publishes on the first acknowledgement and
//! merges subscriptions into one stream with duplicate events removed.

mod pool;
mod websocket;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use nostr::{Event, Filter};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

pub use pool::{RelayPool, Subscription, SubscriptionEvent};
pub use websocket::WebSocketRelayClient;

/// Default relays (same set the browser client used)
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://relay.snort.social",
];

/// Message from a single relay connection
#[derive(Debug, Clone)]
pub enum RelayNotification {
    Event { relay: String, event: Box<Event> },
    /// End of stored events: the relay has sent its backlog
    Eose { relay: String },
    Error { relay: String, message: String },
}

/// Connection to individual relays
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// Send an event to one relay, resolving once the relay accepts it
    async fn publish(&self, relay: &str, event: &Event) -> Result<()>;

    /// Hold a subscription on one relay, forwarding what it sends.
    ///
    /// Returns when the connection ends or `shutdown` flips to true
    /// (or its sender is dropped).
    async fn subscribe(
        &self,
        relay: &str,
        filter: Filter,
        notifications: mpsc::Sender<RelayNotification>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}
