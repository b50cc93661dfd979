//! Inbound signal filtering: authenticity, addressing, dedup and recency

use lru::LruCache;
use nostr::{Event, EventId, PublicKey, Timestamp};
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::{debug, warn};

use super::codec;
use super::types::InboundSignal;
use crate::error::{DecodeError, Error, Result};
use crate::identity::short_key;

/// Default number of event ids remembered for dedup
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Result of routing one relay event
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Fresh, valid and addressed to us
    Dispatch(InboundSignal),
    /// Failed to decode; reported, never fatal
    Rejected(DecodeError),
    /// Already seen (relays echo the same event)
    Duplicate(EventId),
    /// Older than the recency window
    Stale { id: EventId, created_at: Timestamp },
    /// Sent by ourselves or addressed to someone else
    Ignored,
}

impl Routed {
    /// Signals to apply as `Ok(Some(_))`, events that are not ours as
    /// `Ok(None)`, everything else as the matching [`Error`]
    pub fn into_result(self) -> Result<Option<InboundSignal>> {
        match self {
            Routed::Dispatch(inbound) => Ok(Some(inbound)),
            Routed::Ignored => Ok(None),
            Routed::Rejected(e) => Err(e.into()),
            Routed::Duplicate(id) => Err(Error::DuplicateSignal(id.to_hex())),
            Routed::Stale { id, created_at } => Err(Error::StaleSignal {
                id: id.to_hex(),
                created_at: created_at.as_u64(),
            }),
        }
    }
}

pub struct SignalRouter {
    local: PublicKey,
    recency_window: Duration,
    seen: LruCache<EventId, ()>,
}

impl SignalRouter {
    pub fn new(local: PublicKey, recency_window: Duration, dedup_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            recency_window,
            seen: LruCache::new(capacity),
        }
    }

    pub fn recency_window(&self) -> Duration {
        self.recency_window
    }

    /// `since` bound for a subscription opened at `started_at`
    pub fn subscription_since(&self, started_at: Timestamp) -> Timestamp {
        started_at - self.recency_window
    }

    /// Route an event observed at `now`
    pub fn route(&mut self, event: &Event, now: Timestamp) -> Routed {
        let envelope = match codec::decode(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejected signal {}: {}", event.id.to_hex(), e);
                return Routed::Rejected(e);
            }
        };

        if self.seen.contains(&envelope.id) {
            return Routed::Duplicate(envelope.id);
        }

        if envelope.sender == self.local || envelope.recipient != self.local {
            debug!("Ignoring signal {} not meant for us", envelope.id.to_hex());
            return Routed::Ignored;
        }

        let cutoff = now - self.recency_window;
        if envelope.created_at < cutoff {
            debug!(
                "Dropping stale {} from {} (created_at {})",
                envelope.signal.payload_type(),
                short_key(&envelope.sender),
                envelope.created_at.as_u64()
            );
            return Routed::Stale {
                id: envelope.id,
                created_at: envelope.created_at,
            };
        }

        self.seen.put(envelope.id, ());
        debug!(
            "Dispatching {} from {}",
            envelope.signal.payload_type(),
            short_key(&envelope.sender)
        );
        Routed::Dispatch(envelope.into())
    }
}
