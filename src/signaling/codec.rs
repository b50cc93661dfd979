//! Conversion between typed signals and signed Nostr events

use nostr::{Event, EventBuilder, Filter, Kind, PublicKey, Tag, Timestamp};
use serde::Deserialize;

use super::types::{PayloadType, Signal, SignalEnvelope, RECIPIENT_TAG, SIGNAL_KIND};
use crate::error::{DecodeError, Error, Result};
use crate::identity::Identity;

/// Content body before the type is checked
#[derive(Deserialize)]
struct RawBody {
    #[serde(rename = "type")]
    payload_type: String,
    payload: serde_json::Value,
}

/// Build and sign a signaling event addressed to `recipient`
pub fn encode(
    identity: &Identity,
    recipient: &PublicKey,
    signal: &Signal,
    created_at: Timestamp,
) -> Result<Event> {
    let content = serde_json::to_string(signal)?;

    EventBuilder::new(Kind::from(SIGNAL_KIND), content)
        .tags(vec![Tag::public_key(*recipient)])
        .custom_created_at(created_at)
        .sign_with_keys(identity.keys())
        .map_err(|e| Error::Signing(e.to_string()))
}

/// Verify and unwrap a signaling event. Pure: no state, no I/O.
pub fn decode(event: &Event) -> std::result::Result<SignalEnvelope, DecodeError> {
    let kind = event.kind.as_u16();
    if kind != SIGNAL_KIND {
        return Err(DecodeError::WrongKind(kind));
    }

    if event.verify().is_err() {
        return Err(DecodeError::InvalidSignature(event.id.to_hex()));
    }

    let recipient = recipient_of(event).ok_or(DecodeError::MissingRecipient)?;

    let body: RawBody = serde_json::from_str(&event.content)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
    let payload_type: PayloadType = body.payload_type.parse()?;

    Ok(SignalEnvelope {
        id: event.id,
        sender: event.pubkey,
        recipient,
        created_at: event.created_at,
        signal: Signal::new(payload_type, body.payload),
    })
}

/// First `p` tag of an event, if it holds a valid key
pub fn recipient_of(event: &Event) -> Option<PublicKey> {
    event.tags.iter().find_map(|tag| {
        let v: Vec<String> = tag.clone().to_vec();
        if v.len() >= 2 && v[0] == RECIPIENT_TAG {
            PublicKey::from_hex(&v[1]).ok()
        } else {
            None
        }
    })
}

/// Relay filter for signals addressed to `local`
pub fn inbound_filter(local: &PublicKey, since: Timestamp) -> Filter {
    Filter::new()
        .kind(Kind::from(SIGNAL_KIND))
        .pubkey(*local)
        .since(since)
}
