//! Mapping between presentable identity strings and routing keys

use nostr::PublicKey;

use crate::error::Result;
use crate::identity::Identity;

/// Stateless resolver; the active remote peer lives in the session, not here
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerDirectory;

impl PeerDirectory {
    /// Resolve an `npub` (or hex key) entered by the user
    pub fn resolve(display: &str) -> Result<PublicKey> {
        Identity::decode(display)
    }

    pub fn present(key: &PublicKey) -> String {
        Identity::encode(key)
    }

    /// Resolve a list of keys, failing on the first invalid entry
    pub fn resolve_all<S: AsRef<str>>(entries: &[S]) -> Result<Vec<PublicKey>> {
        entries.iter().map(|e| Self::resolve(e.as_ref())).collect()
    }
}
