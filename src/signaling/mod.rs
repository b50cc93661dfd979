//! Call signaling over Nostr relays
//!
//! Signals travel as ephemeral events:
//! - Event kind: 20000
//! - Tag: ["p", <recipient hex pubkey>]
//! - Content: {"type": "offer" | "answer" | "ice", "payload": {...}}

pub mod codec;
mod router;
mod types;


pub use router::{Routed, SignalRouter, DEFAULT_DEDUP_CAPACITY};
pub use types::{
    InboundSignal, PayloadType, Signal, SignalEnvelope, DEFAULT_RECENCY_WINDOW, RECIPIENT_TAG,
    SIGNAL_KIND,
};
