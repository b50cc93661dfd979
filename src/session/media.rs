//! Seams to the media side: local capture and the negotiation engine

use async_trait::async_trait;
use nostr::PublicKey;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::Signal;

/// Callback events raised by a negotiation engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A local ICE candidate was gathered
    IceCandidate(serde_json::Value),
    /// The remote side added a media track
    RemoteTrack { id: String, kind: String },
    ConnectionState(String),
    /// The transport gave up; ends the session
    Failed(String),
}

/// Engine event tagged with the engine instance that raised it
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMessage {
    pub epoch: u64,
    pub event: EngineEvent,
}

/// Sender handed to an engine so callbacks become queued messages
#[derive(Clone)]
pub struct EngineEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineEvents {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(EngineMessage {
            epoch: self.epoch,
            event,
        });
    }
}

/// Offer/answer engine for one peer connection.
///
/// Descriptions and candidates are the engine's own JSON objects, e.g.
/// `{"type": "offer", "sdp": "..."}` and `{"candidate": "...", "sdpMid": "0"}`.
#[async_trait]
pub trait MediaEngine: Send {
    async fn create_offer(&mut self) -> Result<serde_json::Value>;
    async fn create_answer(&mut self) -> Result<serde_json::Value>;
    async fn set_local_description(&mut self, desc: serde_json::Value) -> Result<()>;
    async fn set_remote_description(&mut self, desc: serde_json::Value) -> Result<()>;
    async fn add_ice_candidate(&mut self, candidate: serde_json::Value) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Source of local media and factory for engines that carry it
#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    type Media: Send + Sync + 'static;
    type Engine: MediaEngine + 'static;

    /// Acquire capture resources; fails with `MediaUnavailable`
    async fn acquire_media(&self) -> Result<Self::Media>;

    /// Give capture resources back
    fn release_media(&self, media: Self::Media);

    /// Build an engine sending `media`, with callbacks routed to `events`
    async fn create_engine(&self, media: &Self::Media, events: EngineEvents)
        -> Result<Self::Engine>;
}

/// Outbound path for signals (codec + relay publish in production)
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, recipient: &PublicKey, signal: Signal) -> Result<()>;
}
