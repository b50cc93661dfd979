//! Tests for multi-relay publish and subscription merging

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter, Timestamp};
use tokio::sync::{mpsc, watch};

use super::*;
use crate::error::Error;
use crate::identity::Identity;
use crate::signaling::{codec, Signal};

#[derive(Default)]
struct ScriptedClient {
    /// relay -> (delay before answering, accepted)
    publish: HashMap<String, (Duration, bool)>,
    /// relay -> stored events sent before EOSE
    backlog: HashMap<String, Vec<Event>>,
    refusing: HashSet<String>,
    /// relay -> how long a session stays up before the relay drops it
    dropping: HashMap<String, Duration>,
    connections: Arc<AtomicUsize>,
}

#[async_trait]
impl RelayClient for ScriptedClient {
    async fn publish(&self, relay: &str, _event: &Event) -> crate::error::Result<()> {
        let (delay, accepted) = self
            .publish
            .get(relay)
            .copied()
            .unwrap_or((Duration::ZERO, false));
        tokio::time::sleep(delay).await;
        if accepted {
            Ok(())
        } else {
            Err(Error::Relay(format!("{}: rejected", relay)))
        }
    }

    async fn subscribe(
        &self,
        relay: &str,
        _filter: Filter,
        notifications: mpsc::Sender<RelayNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> crate::error::Result<()> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if self.refusing.contains(relay) {
            return Err(Error::Relay(format!("{}: connection refused", relay)));
        }
        for event in self.backlog.get(relay).cloned().unwrap_or_default() {
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

        if let Some(uptime) = self.dropping.get(relay) {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(*uptime) => {}
            }
            return Ok(());
        }
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn sample_event(n: u64) -> Event {
    let alice = Identity::generate();
    let bob = Identity::generate();
    codec::encode(
        &alice,
        &bob.routing_key(),
        &Signal::Ice(serde_json::json!({ "candidate": format!("c{}", n) })),
        Timestamp::now(),
    )
    .unwrap()
}

fn relays(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_publish_resolves_on_first_ack() {
    let mut client = ScriptedClient::default();
    client.publish.insert("a".into(), (Duration::ZERO, false));
    client.publish.insert("b".into(), (Duration::from_millis(20), true));
    client.publish.insert("c".into(), (Duration::from_secs(30), true));

    let pool = RelayPool::new(client, relays(&["a", "b", "c"]));
    let acked = tokio::time::timeout(Duration::from_secs(5), pool.publish(&sample_event(1)))
        .await
        .expect("publish should not wait for the slowest relay")
        .unwrap();
    assert_eq!(acked, "b");
}

#[tokio::test]
async fn test_publish_fails_when_all_relays_fail() {
    let mut client = ScriptedClient::default();
    client.publish.insert("a".into(), (Duration::ZERO, false));
    client.publish.insert("b".into(), (Duration::from_millis(5), false));

    let pool = RelayPool::new(client, relays(&["a", "b"]));
    match pool.publish(&sample_event(1)).await {
        Err(Error::PublishFailed(msg)) => {
            assert!(msg.contains("a:"));
            assert!(msg.contains("b:"));
        }
        other => panic!("Expected PublishFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_without_relays() {
    let pool = RelayPool::new(ScriptedClient::default(), Vec::new());
    assert!(matches!(
        pool.publish(&sample_event(1)).await,
        Err(Error::PublishFailed(_))
    ));
}

#[tokio::test]
async fn test_subscription_suppresses_cross_relay_duplicates() {
    let e1 = sample_event(1);
    let e2 = sample_event(2);

    let mut client = ScriptedClient::default();
    client.backlog.insert("a".into(), vec![e1.clone()]);
    client.backlog.insert("b".into(), vec![e1.clone(), e2.clone()]);

    let pool = RelayPool::new(client, relays(&["a", "b"]));
    let mut sub = pool.subscribe(Filter::new(), 64);

    let mut events = Vec::new();
    let mut synced = Vec::new();
    while synced.len() < 2 || events.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
            Ok(Some(SubscriptionEvent::Event(event))) => events.push(event.id.to_hex()),
            Ok(Some(SubscriptionEvent::SyncComplete { relay })) => synced.push(relay),
            other => panic!("Subscription ended early: {:?}", other.is_ok()),
        }
    }

    events.sort();
    let mut expected = vec![e1.id.to_hex(), e2.id.to_hex()];
    expected.sort();
    assert_eq!(events, expected);

    synced.sort();
    assert_eq!(synced, relays(&["a", "b"]));

    // Nothing else pending
    assert!(tokio::time::timeout(Duration::from_millis(50), sub.next())
        .await
        .is_err());
}

#[tokio::test]
async fn test_failing_relay_does_not_stop_others() {
    let e1 = sample_event(1);

    let mut client = ScriptedClient::default();
    client.refusing.insert("bad".into());
    client.backlog.insert("good".into(), vec![e1.clone()]);

    let pool = RelayPool::new(client, relays(&["bad", "good"]))
        .with_reconnect_delay(Duration::from_millis(5));
    let mut sub = pool.subscribe(Filter::new(), 64);

    let mut got_event = false;
    let mut got_sync = false;
    while !(got_event && got_sync) {
        match tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
            Ok(Some(SubscriptionEvent::Event(event))) => {
                assert_eq!(event.id, e1.id);
                got_event = true;
            }
            Ok(Some(SubscriptionEvent::SyncComplete { relay })) => {
                assert_eq!(relay, "good");
                got_sync = true;
            }
            _ => panic!("Subscription should keep running"),
        }
    }
}

#[tokio::test]
async fn test_unsubscribe_ends_stream() {
    let mut client = ScriptedClient::default();
    client.refusing.insert("bad".into());
    let pool = RelayPool::new(client, relays(&["bad", "good"]))
        .with_reconnect_delay(Duration::from_millis(5));
    let mut sub = pool.subscribe(Filter::new(), 64);

    match tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
        Ok(Some(SubscriptionEvent::SyncComplete { relay })) => assert_eq!(relay, "good"),
        _ => panic!("Expected sync from good relay"),
    }

    sub.unsubscribe();
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while sub.next().await.is_some() {}
    })
    .await;
    assert!(end.is_ok(), "Stream should close after unsubscribe");
}

#[tokio::test]
async fn test_reconnect_delay_resets_after_healthy_session() {
    let mut client = ScriptedClient::default();
    client.dropping.insert("flaky".into(), Duration::from_millis(20));
    let connections = client.connections.clone();

    let pool = RelayPool::new(client, relays(&["flaky"]))
        .with_reconnect_delay(Duration::from_millis(5));
    let mut sub = pool.subscribe(Filter::new(), 64);
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Doubling from 5 ms would allow about 6 connections in this window
    assert!(connections.load(Ordering::SeqCst) >= 10);
    assert!(matches!(
        sub.next().await,
        Some(SubscriptionEvent::SyncComplete { relay }) if relay == "flaky"
    ));
    sub.unsubscribe();
}

#[tokio::test]
async fn test_refused_connections_back_off() {
    let mut client = ScriptedClient::default();
    client.refusing.insert("bad".into());
    let connections = client.connections.clone();

    let pool = RelayPool::new(client, relays(&["bad"]))
        .with_reconnect_delay(Duration::from_millis(5));
    let sub = pool.subscribe(Filter::new(), 64);
    tokio::time::sleep(Duration::from_millis(400)).await;

    // 5, 10, 20, 40, 80, 160 ms between attempts
    let attempts = connections.load(Ordering::SeqCst);
    assert!((3..=8).contains(&attempts), "{} attempts", attempts);
    sub.unsubscribe();
}
