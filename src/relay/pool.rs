use lru::LruCache;
use nostr::{Event, EventId, Filter};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{RelayClient, RelayNotification};
use crate::error::{Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// What a merged subscription yields
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// First sighting of an event id across all relays
    Event(Event),
    /// A relay finished sending its stored backlog (once per relay)
    SyncComplete { relay: String },
}

/// Fixed set of relays sharing one client
pub struct RelayPool<C: RelayClient> {
    client: Arc<C>,
    relays: Vec<String>,
    reconnect_delay: Duration,
}

impl<C: RelayClient> Clone for RelayPool<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            relays: self.relays.clone(),
            reconnect_delay: self.reconnect_delay,
        }
    }
}

impl<C: RelayClient> RelayPool<C> {
    pub fn new(client: C, relays: Vec<String>) -> Self {
        Self::with_client(Arc::new(client), relays)
    }

    pub fn with_client(client: Arc<C>, relays: Vec<String>) -> Self {
        Self {
            client,
            relays,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// Override the initial delay before re-opening a dropped subscription
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Broadcast to every relay; succeeds on the first acknowledgement.
    ///
    /// Publishes to the remaining relays keep running in the background.
    /// Returns the relay that acknowledged first.
    pub async fn publish(&self, event: &Event) -> Result<String> {
        if self.relays.is_empty() {
            return Err(Error::PublishFailed("no relays configured".to_string()));
        }

        let (result_tx, mut result_rx) = mpsc::channel(self.relays.len());
        for relay in &self.relays {
            let client = self.client.clone();
            let relay = relay.clone();
            let event = event.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let result = client.publish(&relay, &event).await;
                let _ = result_tx.send((relay, result)).await;
            });
        }
        drop(result_tx);

        let mut failures = Vec::new();
        while let Some((relay, result)) = result_rx.recv().await {
            match result {
                Ok(()) => {
                    debug!("Event {} accepted by {}", event.id.to_hex(), relay);
                    return Ok(relay);
                }
                Err(e) => {
                    warn!("Publish to {} failed: {}", relay, e);
                    failures.push(format!("{}: {}", relay, e));
                }
            }
        }

        Err(Error::PublishFailed(failures.join("; ")))
    }

    /// Open a long-lived subscription on every relay
    pub fn subscribe(&self, filter: Filter, dedup_capacity: usize) -> Subscription {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (raw_tx, raw_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        for relay in &self.relays {
            tokio::spawn(relay_task(
                self.client.clone(),
                relay.clone(),
                filter.clone(),
                raw_tx.clone(),
                shutdown_rx.clone(),
                self.reconnect_delay,
            ));
        }
        drop(raw_tx);

        let capacity = NonZeroUsize::new(dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        tokio::spawn(merge_task(raw_rx, events_tx, capacity));

        info!("Subscribed on {} relays", self.relays.len());

        Subscription {
            events: events_rx,
            shutdown: shutdown_tx,
        }
    }
}

/// Keep one relay's subscription open until teardown
async fn relay_task<C: RelayClient>(
    client: Arc<C>,
    relay: String,
    filter: Filter,
    notifications: mpsc::Sender<RelayNotification>,
    mut shutdown: watch::Receiver<bool>,
    base_delay: Duration,
) {
    let mut delay = base_delay;

    loop {
        if *shutdown.borrow() || notifications.is_closed() {
            break;
        }

        let opened = Instant::now();
        match client
            .subscribe(&relay, filter.clone(), notifications.clone(), shutdown.clone())
            .await
        {
            Ok(()) => {
                debug!("Subscription on {} ended", relay);
                // Outlived the backoff: treat the next drop as a fresh one
                if opened.elapsed() >= delay {
                    delay = base_delay;
                }
            }
            Err(e) => {
                let _ = notifications
                    .send(RelayNotification::Error {
                        relay: relay.clone(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        if *shutdown.borrow() || notifications.is_closed() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }

    trace!("Relay task for {} stopped", relay);
}

/// Merge per-relay notifications into one stream, one entry per event id
async fn merge_task(
    mut raw: mpsc::Receiver<RelayNotification>,
    events: mpsc::Sender<SubscriptionEvent>,
    capacity: NonZeroUsize,
) {
    let mut seen: LruCache<EventId, ()> = LruCache::new(capacity);
    let mut synced: HashSet<String> = HashSet::new();

    while let Some(notification) = raw.recv().await {
        let out = match notification {
            RelayNotification::Event { relay, event } => {
                if seen.put(event.id, ()).is_some() {
                    trace!("Duplicate event {} from {}", event.id.to_hex(), relay);
                    continue;
                }
                SubscriptionEvent::Event(*event)
            }
            RelayNotification::Eose { relay } => {
                if !synced.insert(relay.clone()) {
                    continue;
                }
                SubscriptionEvent::SyncComplete { relay }
            }
            RelayNotification::Error { relay, message } => {
                warn!("Relay {} error: {}", relay, message);
                continue;
            }
        };

        if events.send(out).await.is_err() {
            break;
        }
    }
}

/// Merged subscription handle; dropping it tears the subscription down
pub struct Subscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    shutdown: watch::Sender<bool>,
}

impl Subscription {
    /// Next merged event, `None` once every relay task has stopped
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
