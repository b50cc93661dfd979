//! Call session: negotiation with a single remote peer
//!
//! [`SessionMachine`] owns the call state; [`MediaBackend`] and
//! [`MediaEngine`] abstract local capture and the peer connection, and
//! [`SignalSink`] is the outbound path to relays.

mod machine;
mod media;
pub mod rtc;


pub use machine::{SessionEvent, SessionMachine, SessionState, MAX_EARLY_CANDIDATES};
pub use media::{
    EngineEvent, EngineEvents, EngineMessage, MediaBackend, MediaEngine, SignalSink,
};
pub use rtc::{LocalTracks, RtcBackend, RtcEngine, DEFAULT_STUN_SERVER};
