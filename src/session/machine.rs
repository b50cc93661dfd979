//! Per-call negotiation state machine
//!
//! One remote peer at a time. Inbound signals, engine callbacks and user
//! commands are fed in sequentially by the owning context, so no step here
//! ever observes another one half-done.

use nostr::PublicKey;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::media::{
    EngineEvent, EngineEvents, EngineMessage, MediaBackend, MediaEngine, SignalSink,
};
use crate::directory::PeerDirectory;
use crate::error::{Error, Result};
use crate::identity::short_key;
use crate::signaling::{InboundSignal, PayloadType, Signal};

/// Candidates held while idle, before the matching offer shows up
pub const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    AwaitingLocalMedia,
    Offering,
    AwaitingAnswer,
    AnsweringOffer,
    Connected,
    /// Transient: resources released, about to become Idle
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingLocalMedia => "awaiting-local-media",
            SessionState::Offering => "offering",
            SessionState::AwaitingAnswer => "awaiting-answer",
            SessionState::AnsweringOffer => "answering-offer",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for whatever presents the call to the user
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    IncomingCall { from: PublicKey },
    SignalSent { payload_type: PayloadType, to: PublicKey },
    RemoteTrack { id: String, kind: String },
    ConnectionState(String),
    SyncComplete { relay: String },
    SignalRejected(String),
    Error(String),
}

/// Resources and negotiation progress for the active remote peer
struct PeerSession<B: MediaBackend> {
    remote: PublicKey,
    media: Option<B::Media>,
    engine: Option<B::Engine>,
    /// Epoch of `engine`; events tagged otherwise come from a retired engine
    epoch: u64,
    remote_description_set: bool,
    pending_ice: VecDeque<serde_json::Value>,
    /// Offer or answer whose publish failed, kept for retry
    unsent: Option<Signal>,
}

impl<B: MediaBackend> PeerSession<B> {
    fn new(remote: PublicKey, media: B::Media, pending_ice: VecDeque<serde_json::Value>) -> Self {
        Self {
            remote,
            media: Some(media),
            engine: None,
            epoch: 0,
            remote_description_set: false,
            pending_ice,
            unsent: None,
        }
    }
}

pub struct SessionMachine<B: MediaBackend, S: SignalSink> {
    local: PublicKey,
    backend: B,
    sink: S,
    state: SessionState,
    session: Option<PeerSession<B>>,
    early_ice: VecDeque<(PublicKey, serde_json::Value)>,
    /// Peer of the last torn-down session; its late candidates are dropped
    departed: Option<PublicKey>,
    /// Empty means anyone may call
    accept_from: Vec<PublicKey>,
    next_epoch: u64,
    engine_tx: mpsc::UnboundedSender<EngineMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<B: MediaBackend, S: SignalSink> SessionMachine<B, S> {
    /// Create an idle machine. The returned receiver carries engine
    /// callbacks and must be fed back through [`Self::handle_engine`].
    pub fn new(
        local: PublicKey,
        backend: B,
        sink: S,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineMessage>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let machine = Self {
            local,
            backend,
            sink,
            state: SessionState::Idle,
            session: None,
            early_ice: VecDeque::new(),
            departed: None,
            accept_from: Vec::new(),
            next_epoch: 0,
            engine_tx,
            events,
        };
        (machine, engine_rx)
    }

    /// Only answer offers from these keys (empty: accept everyone)
    pub fn set_accept_from(&mut self, keys: Vec<PublicKey>) {
        self.accept_from = keys;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The peer of the active session
    pub fn remote(&self) -> Option<PublicKey> {
        self.session.as_ref().map(|s| s.remote)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Candidates waiting for the remote description
    pub fn queued_candidates(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.pending_ice.len())
    }

    /// Start an outbound call
    pub async fn call(&mut self, remote: PublicKey) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot place a call while {}",
                self.state
            )));
        }
        if remote == self.local {
            return Err(Error::InvalidState("cannot call yourself".to_string()));
        }

        info!("Calling {}", short_key(&remote));
        self.set_state(SessionState::AwaitingLocalMedia);

        let media = match self.backend.acquire_media().await {
            Ok(media) => media,
            Err(e) => {
                warn!("Local media unavailable: {}", e);
                self.set_state(SessionState::Idle);
                return Err(media_unavailable(e));
            }
        };
        let pending = self.take_early_candidates(&remote);
        self.session = Some(PeerSession::new(remote, media, pending));

        let result = self.start_offer().await;
        self.settle(result).await
    }

    /// End the call from any state, releasing media and the engine
    pub async fn hangup(&mut self) {
        if let Some(remote) = self.remote() {
            info!("Hanging up on {}", short_key(&remote));
        }
        self.teardown().await;
    }

    /// Re-publish the offer or answer whose publish failed
    pub async fn retry(&mut self) -> Result<()> {
        let signal = self
            .session
            .as_ref()
            .and_then(|s| s.unsent.clone())
            .ok_or_else(|| Error::InvalidState("nothing to resend".to_string()))?;

        info!("Resending {}", signal.payload_type());
        self.publish(signal.clone()).await?;

        match (&signal, self.state) {
            (Signal::Offer(_), SessionState::Offering) => {
                self.set_state(SessionState::AwaitingAnswer)
            }
            (Signal::Answer(_), SessionState::AnsweringOffer) => {
                self.set_state(SessionState::Connected)
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply a routed inbound signal
    pub async fn handle_signal(&mut self, inbound: InboundSignal) -> Result<()> {
        let InboundSignal { sender, signal } = inbound;
        let result = match signal {
            Signal::Offer(offer) => self.on_offer(sender, offer).await,
            Signal::Answer(answer) => self.on_answer(sender, answer).await,
            Signal::Ice(candidate) => self.on_candidate(sender, candidate).await,
        };
        self.settle(result).await
    }

    /// Apply an engine callback
    pub async fn handle_engine(&mut self, message: EngineMessage) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            trace!("Engine event with no session: {:?}", message.event);
            return Ok(());
        };
        if session.engine.is_none() || session.epoch != message.epoch {
            trace!("Ignoring event from retired engine {}", message.epoch);
            return Ok(());
        }
        let remote = session.remote;

        match message.event {
            EngineEvent::IceCandidate(candidate) => {
                // Trickled as soon as gathered, even before we're connected
                match self.sink.send(&remote, Signal::Ice(candidate)).await {
                    Ok(()) => self.emit(SessionEvent::SignalSent {
                        payload_type: PayloadType::Ice,
                        to: remote,
                    }),
                    Err(e) => warn!("Failed to send candidate to {}: {}", short_key(&remote), e),
                }
                Ok(())
            }
            EngineEvent::RemoteTrack { id, kind } => {
                info!("Remote {} track from {}", kind, short_key(&remote));
                self.emit(SessionEvent::RemoteTrack { id, kind });
                Ok(())
            }
            EngineEvent::ConnectionState(state) => {
                debug!("Connection to {}: {}", short_key(&remote), state);
                self.emit(SessionEvent::ConnectionState(state));
                Ok(())
            }
            EngineEvent::Failed(reason) => self.settle(Err(Error::Negotiation(reason))).await,
        }
    }

    async fn on_offer(&mut self, sender: PublicKey, offer: serde_json::Value) -> Result<()> {
        let Some(remote) = self.remote() else {
            return self.accept_offer(sender, offer).await;
        };

        if remote != sender {
            warn!(
                "Busy with {}, rejecting offer from {}",
                short_key(&remote),
                short_key(&sender)
            );
            return Err(Error::PeerBusy(PeerDirectory::present(&sender)));
        }

        match self.state {
            SessionState::Offering | SessionState::AwaitingAnswer => {
                self.resolve_glare(sender, offer).await
            }
            _ => {
                debug!("Ignoring repeated offer from {}", short_key(&sender));
                Ok(())
            }
        }
    }

    async fn accept_offer(&mut self, sender: PublicKey, offer: serde_json::Value) -> Result<()> {
        if !self.accept_from.is_empty() && !self.accept_from.contains(&sender) {
            warn!("Ignoring offer from {} (not in accept list)", short_key(&sender));
            return Ok(());
        }

        info!("Incoming call from {}", short_key(&sender));
        self.emit(SessionEvent::IncomingCall { from: sender });

        let media = self
            .backend
            .acquire_media()
            .await
            .map_err(media_unavailable)?;
        let pending = self.take_early_candidates(&sender);
        self.session = Some(PeerSession::new(sender, media, pending));

        self.answer(offer).await
    }

    /// Both sides offered. The lower key keeps its offer, the other side
    /// drops its engine (keeping media) and answers.
    async fn resolve_glare(&mut self, sender: PublicKey, offer: serde_json::Value) -> Result<()> {
        if self.local.to_hex() < sender.to_hex() {
            info!("Offer collision with {}, keeping ours", short_key(&sender));
            return Ok(());
        }

        info!("Offer collision with {}, answering theirs", short_key(&sender));
        if let Some(session) = self.session.as_mut() {
            if let Some(mut engine) = session.engine.take() {
                if let Err(e) = engine.close().await {
                    warn!("Error closing superseded engine: {}", e);
                }
            }
            session.unsent = None;
            session.remote_description_set = false;
        }

        self.answer(offer).await
    }

    async fn start_offer(&mut self) -> Result<()> {
        self.attach_engine().await?;
        self.set_state(SessionState::Offering);

        let offer = {
            let engine = self.engine_mut()?;
            let offer = engine.create_offer().await.map_err(negotiation)?;
            engine
                .set_local_description(offer.clone())
                .await
                .map_err(negotiation)?;
            offer
        };

        self.publish(Signal::Offer(offer)).await?;
        self.set_state(SessionState::AwaitingAnswer);
        Ok(())
    }

    async fn answer(&mut self, offer: serde_json::Value) -> Result<()> {
        self.attach_engine().await?;
        self.set_state(SessionState::AnsweringOffer);
        self.apply_remote_description(offer).await?;

        let answer = {
            let engine = self.engine_mut()?;
            let answer = engine.create_answer().await.map_err(negotiation)?;
            engine
                .set_local_description(answer.clone())
                .await
                .map_err(negotiation)?;
            answer
        };

        self.publish(Signal::Answer(answer)).await?;
        self.set_state(SessionState::Connected);
        if let Some(remote) = self.remote() {
            info!("Call connected with {}", short_key(&remote));
        }
        Ok(())
    }

    async fn on_answer(&mut self, sender: PublicKey, answer: serde_json::Value) -> Result<()> {
        if self.remote() != Some(sender) {
            debug!("Ignoring answer from {}", short_key(&sender));
            return Ok(());
        }

        match self.state {
            SessionState::Offering | SessionState::AwaitingAnswer => {
                self.apply_remote_description(answer).await?;
                if let Some(session) = self.session.as_mut() {
                    session.unsent = None;
                }
                self.set_state(SessionState::Connected);
                info!("Call connected with {}", short_key(&sender));
                Ok(())
            }
            state => {
                debug!("Ignoring answer from {} while {}", short_key(&sender), state);
                Ok(())
            }
        }
    }

    async fn on_candidate(&mut self, sender: PublicKey, candidate: serde_json::Value) -> Result<()> {
        if self.session.is_none() {
            self.hold_early_candidate(sender, candidate);
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.remote != sender {
            debug!("Ignoring candidate from {}", short_key(&sender));
            return Ok(());
        }

        expect_object("candidate", &candidate)?;
        match session.engine.as_mut() {
            Some(engine) if session.remote_description_set => {
                engine
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(negotiation)?;
            }
            _ => {
                session.pending_ice.push_back(candidate);
                trace!("Queued candidate ({} pending)", session.pending_ice.len());
            }
        }
        Ok(())
    }

    /// Set the remote description, then replay queued candidates in order
    async fn apply_remote_description(&mut self, desc: serde_json::Value) -> Result<()> {
        expect_object("session description", &desc)?;
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let engine = session.engine.as_mut().ok_or_else(no_engine)?;

        engine
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;
        session.remote_description_set = true;

        let queued = session.pending_ice.len();
        while let Some(candidate) = session.pending_ice.pop_front() {
            expect_object("candidate", &candidate)?;
            engine
                .add_ice_candidate(candidate)
                .await
                .map_err(negotiation)?;
        }
        if queued > 0 {
            debug!("Applied {} queued candidates", queued);
        }
        Ok(())
    }

    /// Create a fresh engine for the active session under a new epoch
    async fn attach_engine(&mut self) -> Result<()> {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let events = EngineEvents::new(epoch, self.engine_tx.clone());

        let session = self.session.as_mut().ok_or_else(no_session)?;
        let media = session
            .media
            .as_ref()
            .ok_or_else(|| Error::InvalidState("session has no media".to_string()))?;
        let engine = self
            .backend
            .create_engine(media, events)
            .await
            .map_err(negotiation)?;

        session.engine = Some(engine);
        session.epoch = epoch;
        session.remote_description_set = false;
        Ok(())
    }

    fn engine_mut(&mut self) -> Result<&mut B::Engine> {
        self.session
            .as_mut()
            .and_then(|s| s.engine.as_mut())
            .ok_or_else(no_engine)
    }

    async fn publish(&mut self, signal: Signal) -> Result<()> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let remote = session.remote;
        let payload_type = signal.payload_type();

        match self.sink.send(&remote, signal.clone()).await {
            Ok(()) => {
                session.unsent = None;
                self.emit(SessionEvent::SignalSent {
                    payload_type,
                    to: remote,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", payload_type, short_key(&remote), e);
                session.unsent = Some(signal);
                Err(publish_failed(e))
            }
        }
    }

    fn hold_early_candidate(&mut self, sender: PublicKey, candidate: serde_json::Value) {
        if self.departed == Some(sender) {
            trace!("Dropping late candidate from {}", short_key(&sender));
            return;
        }
        self.early_ice.push_back((sender, candidate));
        while self.early_ice.len() > MAX_EARLY_CANDIDATES {
            self.early_ice.pop_front();
        }
        trace!("Holding early candidate from {}", short_key(&sender));
    }

    fn take_early_candidates(&mut self, sender: &PublicKey) -> VecDeque<serde_json::Value> {
        self.departed = None;
        let mut taken = VecDeque::new();
        self.early_ice.retain(|(from, candidate)| {
            if from == sender {
                taken.push_back(candidate.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Tear down on fatal errors, pass the result through
    async fn settle(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Call failed: {}", e);
                self.teardown().await;
            }
        }
        result
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(mut engine) = session.engine.take() {
                if let Err(e) = engine.close().await {
                    warn!("Error closing engine: {}", e);
                }
            }
            if let Some(media) = session.media.take() {
                self.backend.release_media(media);
            }
            if !session.pending_ice.is_empty() {
                debug!("Discarded {} queued candidates", session.pending_ice.len());
            }
            // Candidates of the old session must never reach a later one
            self.early_ice.retain(|(from, _)| *from != session.remote);
            self.departed = Some(session.remote);
        }

        if self.state != SessionState::Idle {
            self.set_state(SessionState::Closed);
            self.set_state(SessionState::Idle);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session {} -> {}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Payloads are engine objects; anything else is malformed
fn expect_object(what: &str, payload: &serde_json::Value) -> Result<()> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(Error::MalformedPayload(format!("{} is not an object: {}", what, payload)))
    }
}

fn no_session() -> Error {
    Error::InvalidState("no active session".to_string())
}

fn no_engine() -> Error {
    Error::InvalidState("no negotiation engine".to_string())
}

fn negotiation(e: Error) -> Error {
    match e {
        Error::Negotiation(_) => e,
        other => Error::Negotiation(other.to_string()),
    }
}

fn media_unavailable(e: Error) -> Error {
    match e {
        Error::MediaUnavailable(_) => e,
        other => Error::MediaUnavailable(other.to_string()),
    }
}

fn publish_failed(e: Error) -> Error {
    match e {
        Error::PublishFailed(_) => e,
        other => Error::PublishFailed(other.to_string()),
    }
}
