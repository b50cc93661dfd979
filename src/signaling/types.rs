//! Signaling message types carried inside Nostr events

use nostr::{EventId, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::DecodeError;

/// Event kind for call signaling (ephemeral range, not stored by relays)
pub const SIGNAL_KIND: u16 = 20000;

/// Tag name used to address the recipient
pub const RECIPIENT_TAG: &str = "p";

/// Default window in which a signal is fresh enough to act on
pub const DEFAULT_RECENCY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Offer,
    Answer,
    Ice,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Offer => "offer",
            PayloadType::Answer => "answer",
            PayloadType::Ice => "ice",
        }
    }
}

impl FromStr for PayloadType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(PayloadType::Offer),
            "answer" => Ok(PayloadType::Answer),
            "ice" => Ok(PayloadType::Ice),
            other => Err(DecodeError::UnknownPayloadType(other.to_string())),
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed signal: `{"type": ..., "payload": ...}` in the event content.
///
/// Payloads are the media engine's own session description / candidate
/// objects and are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Signal {
    Offer(serde_json::Value),
    Answer(serde_json::Value),
    Ice(serde_json::Value),
}

impl Signal {
    pub fn new(payload_type: PayloadType, payload: serde_json::Value) -> Self {
        match payload_type {
            PayloadType::Offer => Signal::Offer(payload),
            PayloadType::Answer => Signal::Answer(payload),
            PayloadType::Ice => Signal::Ice(payload),
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Signal::Offer(_) => PayloadType::Offer,
            Signal::Answer(_) => PayloadType::Answer,
            Signal::Ice(_) => PayloadType::Ice,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            Signal::Offer(p) | Signal::Answer(p) | Signal::Ice(p) => p,
        }
    }

    pub fn into_payload(self) -> serde_json::Value {
        match self {
            Signal::Offer(p) | Signal::Answer(p) | Signal::Ice(p) => p,
        }
    }
}

/// A verified signaling event
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub id: EventId,
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub created_at: Timestamp,
    pub signal: Signal,
}

/// What the router hands to the session state machine
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub sender: PublicKey,
    pub signal: Signal,
}

impl From<SignalEnvelope> for InboundSignal {
    fn from(envelope: SignalEnvelope) -> Self {
        Self {
            sender: envelope.sender,
            signal: envelope.signal,
        }
    }
}
