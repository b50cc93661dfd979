//! Shared fixtures: an in-memory relay network and a scripted media backend

#![allow(dead_code)]

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_call::error::{Error, Result};
use nostr_call::relay::{RelayClient, RelayNotification};
use nostr_call::session::{EngineEvent, EngineEvents, MediaBackend, MediaEngine};
use nostr_call::{
    Identity, RelayPool, SessionContext, SessionEvent, SessionHandle, SessionSettings,
    SessionState,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct RelayState {
    stored: HashMap<String, Vec<Event>>,
    subscribers: HashMap<String, Vec<(Filter, mpsc::Sender<RelayNotification>)>>,
    read_only: HashSet<String>,
}

/// Relays living in process memory. Every relay stores what it gets and
/// fans it out to matching subscriptions, so a participant using several
/// relays sees each event once per relay.
#[derive(Clone, Default)]
pub struct MemoryRelays {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject publishes on `relay` (subscriptions keep working)
    pub fn set_read_only(&self, relay: &str, read_only: bool) {
        let mut state = self.state.lock().unwrap();
        if read_only {
            state.read_only.insert(relay.to_string());
        } else {
            state.read_only.remove(relay);
        }
    }

    /// Store and deliver an event as if someone else had published it
    pub async fn inject(&self, relay: &str, event: Event) {
        self.deliver(relay, event).await;
    }

    async fn deliver(&self, relay: &str, event: Event) {
        let targets: Vec<mpsc::Sender<RelayNotification>> = {
            let mut state = self.state.lock().unwrap();
            state
                .stored
                .entry(relay.to_string())
                .or_default()
                .push(event.clone());
            let subscribers = state.subscribers.entry(relay.to_string()).or_default();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(filter, _)| filter.match_event(&event))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        for tx in targets {
            let _ = tx
                .send(RelayNotification::Event {
                    relay: relay.to_string(),
                    event: Box::new(event.clone()),
                })
                .await;
        }
    }
}

#[async_trait]
impl RelayClient for MemoryRelays {
    async fn publish(&self, relay: &str, event: &Event) -> Result<()> {
        if self.state.lock().unwrap().read_only.contains(relay) {
            return Err(Error::Relay(format!("{}: blocked: read-only", relay)));
        }
        self.deliver(relay, event.clone()).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        relay: &str,
        filter: Filter,
        notifications: mpsc::Sender<RelayNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let backlog: Vec<Event> = {
            let mut state = self.state.lock().unwrap();
            state
                .subscribers
                .entry(relay.to_string())
                .or_default()
                .push((filter.clone(), notifications.clone()));
            state
                .stored
                .get(relay)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| filter.match_event(e))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for event in backlog {
            let _ = notifications
                .send(RelayNotification::Event {
                    relay: relay.to_string(),
                    event: Box::new(event),
                })
                .await;
        }
        let _ = notifications
            .send(RelayNotification::Eose {
                relay: relay.to_string(),
            })
            .await;

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MediaCounters {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
}

impl MediaCounters {
    pub fn get(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn balanced(&self) -> bool {
        self.get(&self.acquired) == self.get(&self.released)
            && self.get(&self.created) == self.get(&self.closed)
    }
}

/// Media backend whose engines produce canned descriptions and trickle
/// one local candidate after each local description
#[derive(Clone, Default)]
pub struct ScriptedMedia {
    pub counters: Arc<MediaCounters>,
}

pub struct ScriptedEngine {
    counters: Arc<MediaCounters>,
    events: EngineEvents,
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn create_offer(&mut self) -> Result<serde_json::Value> {
        Ok(json!({"type": "offer", "sdp": format!("v=0 offer {}", self.events.epoch())}))
    }

    async fn create_answer(&mut self) -> Result<serde_json::Value> {
        Ok(json!({"type": "answer", "sdp": format!("v=0 answer {}", self.events.epoch())}))
    }

    async fn set_local_description(&mut self, _desc: serde_json::Value) -> Result<()> {
        self.events.emit(EngineEvent::IceCandidate(json!({
            "candidate": format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.events.epoch()),
            "sdpMid": "0",
            "sdpMLineIndex": 0
        })));
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: serde_json::Value) -> Result<()> {
        if desc.get("sdp").and_then(|s| s.as_str()).is_none() {
            return Err(Error::Negotiation("description has no sdp".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _candidate: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for ScriptedMedia {
    type Media = ();
    type Engine = ScriptedEngine;

    async fn acquire_media(&self) -> Result<()> {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_media(&self, _media: ()) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn create_engine(&self, _media: &(), events: EngineEvents) -> Result<ScriptedEngine> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedEngine {
            counters: self.counters.clone(),
            events,
        })
    }
}

/// A running participant
pub struct Participant {
    pub identity: Identity,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub media: ScriptedMedia,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl Participant {
    pub fn start(relays: &MemoryRelays, relay_names: &[&str]) -> Self {
        Self::start_with(relays, relay_names, Identity::generate(), SessionSettings::default())
    }

    pub fn start_with(
        relays: &MemoryRelays,
        relay_names: &[&str],
        identity: Identity,
        settings: SessionSettings,
    ) -> Self {
        let pool = RelayPool::new(
            relays.clone(),
            relay_names.iter().map(|r| r.to_string()).collect(),
        )
        .with_reconnect_delay(Duration::from_millis(10));
        let media = ScriptedMedia::default();
        let (context, handle, events) =
            SessionContext::new(identity.clone(), pool, media.clone(), settings);
        let task = tokio::spawn(context.run());
        Self {
            identity,
            handle,
            events,
            media,
            task,
        }
    }

    pub fn key(&self) -> nostr::PublicKey {
        self.identity.routing_key()
    }

    /// Poll until the session reaches `state`
    pub async fn wait_for_state(&self, state: SessionState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.handle.state().await.ok() == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        let current = self.handle.state().await.ok();
        assert!(
            reached.is_ok(),
            "Timed out waiting for {}, still {:?}",
            state,
            current
        );
    }

    /// Wait until every relay reported its initial sync
    pub async fn wait_synced(&mut self, relay_count: usize) {
        let mut synced = 0;
        tokio::time::timeout(Duration::from_secs(5), async {
            while synced < relay_count {
                match self.events.recv().await {
                    Some(SessionEvent::SyncComplete { .. }) => synced += 1,
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .expect("relays never synced");
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Let queued relay traffic settle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
