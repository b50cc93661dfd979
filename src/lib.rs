pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod identity;
pub mod relay;
pub mod session;
pub mod signaling;

pub use config::Config;
pub use context::{SessionContext, SessionHandle, SessionSettings, SignalPublisher};
pub use directory::PeerDirectory;
pub use error::{DecodeError, Error, Result};
pub use identity::Identity;
pub use relay::{RelayClient, RelayPool, WebSocketRelayClient, DEFAULT_RELAYS};
pub use session::{RtcBackend, SessionEvent, SessionMachine, SessionState};
pub use signaling::{Signal, SignalRouter, SIGNAL_KIND};
