//! Error types for nostr-call

use thiserror::Error;

/// Reasons a wire event cannot be turned into a signal envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected event kind: {0}")]
    WrongKind(u16),

    #[error("Event has no recipient tag")]
    MissingRecipient,

    #[error("Invalid signature on event {0}")]
    InvalidSignature(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid identity encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid signature on event {0}")]
    InvalidSignature(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Busy with another peer: {0}")]
    PeerBusy(String),

    #[error("Stale signal {id} (created_at {created_at})")]
    StaleSignal { id: String, created_at: u64 },

    #[error("Duplicate signal {0}")]
    DuplicateSignal(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Errors that end the current session when raised during negotiation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_) | Error::MalformedPayload(_) | Error::Signing(_)
        )
    }

    /// Inbound signals dropped without telling the user
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::StaleSignal { .. } | Error::DuplicateSignal(_))
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::InvalidSignature(id) => Error::InvalidSignature(id),
            DecodeError::UnknownPayloadType(t) => Error::UnknownPayloadType(t),
            DecodeError::MalformedPayload(m) => Error::MalformedPayload(m),
            other => Error::MalformedPayload(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
