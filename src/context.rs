//! Session context: ties identity, relays, routing and the call state
//! machine together in one event loop

use async_trait::async_trait;
use nostr::{Event, PublicKey, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identity::{short_key, Identity};
use crate::relay::{RelayClient, RelayPool, SubscriptionEvent};
use crate::session::{
    EngineMessage, MediaBackend, SessionEvent, SessionMachine, SessionState, SignalSink,
};
use crate::signaling::{codec, Signal, SignalRouter, DEFAULT_DEDUP_CAPACITY, DEFAULT_RECENCY_WINDOW};

/// Tunables for routing and call acceptance
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub recency_window: Duration,
    pub dedup_capacity: usize,
    /// Only answer these keys; empty accepts everyone
    pub accept_from: Vec<PublicKey>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            recency_window: DEFAULT_RECENCY_WINDOW,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            accept_from: Vec::new(),
        }
    }
}

/// Encodes signals as signed events and broadcasts them to the pool
pub struct SignalPublisher<C: RelayClient> {
    identity: Arc<Identity>,
    pool: RelayPool<C>,
}

impl<C: RelayClient> SignalPublisher<C> {
    pub fn new(identity: Arc<Identity>, pool: RelayPool<C>) -> Self {
        Self { identity, pool }
    }
}

#[async_trait]
impl<C: RelayClient> SignalSink for SignalPublisher<C> {
    async fn send(&self, recipient: &PublicKey, signal: Signal) -> Result<()> {
        let payload_type = signal.payload_type();
        let event = codec::encode(&self.identity, recipient, &signal, Timestamp::now())?;
        debug!(
            "Publishing {} {} to {}",
            payload_type,
            event.id.to_hex(),
            short_key(recipient)
        );
        let relay = self.pool.publish(&event).await?;
        debug!("{} to {} acknowledged by {}", payload_type, short_key(recipient), relay);
        Ok(())
    }
}

enum Command {
    Call {
        remote: PublicKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Hangup {
        reply: oneshot::Sender<()>,
    },
    Retry {
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
}

/// Cloneable handle for driving a running [`SessionContext`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
}

fn stopped() -> Error {
    Error::InvalidState("session loop has stopped".to_string())
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Place a call to `remote`
    pub async fn call(&self, remote: PublicKey) -> Result<()> {
        self.request(|reply| Command::Call { remote, reply }).await?
    }

    pub async fn hangup(&self) -> Result<()> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    /// Resend the offer/answer after a failed publish
    pub async fn retry(&self) -> Result<()> {
        self.request(|reply| Command::Retry { reply }).await?
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Stop the loop; any active call is hung up first
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Everything one running participant owns
pub struct SessionContext<C: RelayClient, B: MediaBackend> {
    identity: Arc<Identity>,
    pool: RelayPool<C>,
    router: SignalRouter,
    dedup_capacity: usize,
    machine: SessionMachine<B, SignalPublisher<C>>,
    engine_rx: mpsc::UnboundedReceiver<EngineMessage>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<C: RelayClient, B: MediaBackend> SessionContext<C, B> {
    /// Build a context plus its control handle and the UI event stream
    pub fn new(
        identity: Identity,
        pool: RelayPool<C>,
        backend: B,
        settings: SessionSettings,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let identity = Arc::new(identity);
        let local = identity.routing_key();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publisher = SignalPublisher::new(identity.clone(), pool.clone());
        let (mut machine, engine_rx) =
            SessionMachine::new(local, backend, publisher, events_tx.clone());
        machine.set_accept_from(settings.accept_from);

        let context = Self {
            identity,
            pool,
            router: SignalRouter::new(local, settings.recency_window, settings.dedup_capacity),
            dedup_capacity: settings.dedup_capacity,
            machine,
            engine_rx,
            commands: commands_rx,
            shutdown: shutdown_rx,
            events: events_tx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (context, handle, events_rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Subscribe and process signals, engine callbacks and commands until
    /// shutdown
    pub async fn run(mut self) -> Result<()> {
        let local = self.identity.routing_key();
        let since = self.router.subscription_since(Timestamp::now());
        let mut subscription = self
            .pool
            .subscribe(codec::inbound_filter(&local, since), self.dedup_capacity);

        info!(
            "Listening for calls as {} on {} relays",
            self.identity.display(),
            self.pool.relays().len()
        );

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Session shutting down");
                        break;
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                item = subscription.next() => {
                    match item {
                        Some(SubscriptionEvent::Event(event)) => self.handle_event(&event).await,
                        Some(SubscriptionEvent::SyncComplete { relay }) => {
                            debug!("Initial sync complete on {}", relay);
                            self.emit(SessionEvent::SyncComplete { relay });
                        }
                        None => {
                            warn!("Relay subscription closed");
                            break;
                        }
                    }
                }
                Some(message) = self.engine_rx.recv() => {
                    let result = self.machine.handle_engine(message).await;
                    self.report(result);
                }
            }
        }

        self.machine.hangup().await;
        subscription.unsubscribe();
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call { remote, reply } => {
                let result = self.machine.call(remote).await;
                if let Err(e) = &result {
                    self.emit(SessionEvent::Error(e.to_string()));
                }
                let _ = reply.send(result);
            }
            Command::Hangup { reply } => {
                self.machine.hangup().await;
                let _ = reply.send(());
            }
            Command::Retry { reply } => {
                let result = self.machine.retry().await;
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.machine.state());
            }
        }
    }

    async fn handle_event(&mut self, event: &Event) {
        match self.router.route(event, Timestamp::now()).into_result() {
            Ok(Some(inbound)) => {
                let result = self.machine.handle_signal(inbound).await;
                self.report(result);
            }
            Ok(None) => {}
            Err(e) if e.is_silent() => trace!("{}", e),
            Err(e) => self.emit(SessionEvent::SignalRejected(e.to_string())),
        }
    }

    fn report(&self, result: Result<()>) {
        if let Err(e) = result {
            warn!("{}", e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
