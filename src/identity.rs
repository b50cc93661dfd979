//! Local Nostr identity used to sign and address signaling events
//!
//! The routing key is the x-only secp256k1 public key (hex in event tags),
//! the display encoding is its NIP-19 `npub`.

use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::secp256k1::schnorr::Signature;
use nostr::secp256k1::{Message, XOnlyPublicKey};
use nostr::{Keys, PublicKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Keypair owned for the whole process lifetime
#[derive(Clone)]
pub struct Identity {
    keys: Keys,
}

impl Identity {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self { keys }
    }

    /// Import a secret key given as `nsec` or hex
    pub fn from_secret(secret: &str) -> Result<Self> {
        let keys = Keys::parse(secret.trim())
            .map_err(|_| Error::InvalidEncoding("invalid secret key".to_string()))?;
        Ok(Self { keys })
    }

    pub fn routing_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Human-presentable encoding of the local routing key
    pub fn display(&self) -> String {
        Self::encode(&self.routing_key())
    }

    pub(crate) fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Schnorr signature over the SHA-256 digest of `bytes`
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let message = Message::from_digest(Sha256::digest(bytes).into());
        self.keys.sign_schnorr(&message)
    }

    /// Check a signature produced by [`Identity::sign`]
    pub fn verify(key: &PublicKey, bytes: &[u8], signature: &Signature) -> bool {
        let Ok(xonly) = XOnlyPublicKey::from_slice(&key.to_bytes()) else {
            return false;
        };
        let message = Message::from_digest(Sha256::digest(bytes).into());
        SECP256K1.verify_schnorr(signature, &message, &xonly).is_ok()
    }

    /// Encode a routing key as `npub`
    pub fn encode(key: &PublicKey) -> String {
        key.to_bech32().unwrap_or_else(|_| key.to_hex())
    }

    /// Decode an `npub` or 64-char hex string into a routing key
    pub fn decode(s: &str) -> Result<PublicKey> {
        let s = s.trim();
        let parsed = if s.starts_with("npub1") {
            PublicKey::from_bech32(s).ok()
        } else if s.len() == 64 {
            PublicKey::from_hex(s).ok()
        } else {
            None
        };
        parsed.ok_or_else(|| Error::InvalidEncoding(s.to_string()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("npub", &self.display())
            .finish_non_exhaustive()
    }
}

/// Short form of a routing key for log lines
pub fn short_key(key: &PublicKey) -> String {
    let hex = key.to_hex();
    hex[..8.min(hex.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::nips::nip19::ToBech32;

    #[test]
    fn test_generate_is_stable() {
        let identity = Identity::generate();
        assert_eq!(identity.routing_key(), identity.routing_key());
        assert!(identity.display().starts_with("npub1"));
    }

    #[test]
    fn test_encode_decode() -> anyhow::Result<()> {
        let identity = Identity::generate();
        let key = identity.routing_key();

        assert_eq!(Identity::decode(&Identity::encode(&key))?, key);
        assert_eq!(Identity::decode(&key.to_hex())?, key);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Identity::decode("npub1notreallyakey"),
            Err(Error::InvalidEncoding(_))
        ));
        assert!(matches!(
            Identity::decode("hello"),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let sig = identity.sign(b"offer");

        assert!(Identity::verify(&identity.routing_key(), b"offer", &sig));
        assert!(!Identity::verify(&identity.routing_key(), b"answer", &sig));
        assert!(!Identity::verify(&other.routing_key(), b"offer", &sig));
    }

    #[test]
    fn test_import_secret_derives_same_key() -> anyhow::Result<()> {
        let identity = Identity::generate();
        let nsec = identity.keys().secret_key().to_bech32()?;
        let imported = Identity::from_secret(&nsec)?;
        assert_eq!(imported.routing_key(), identity.routing_key());
        Ok(())
    }

    #[test]
    fn test_debug_hides_secret() -> anyhow::Result<()> {
        let identity = Identity::generate();
        let nsec = identity.keys().secret_key().to_bech32()?;
        let secret_hex: String = identity
            .keys()
            .secret_key()
            .to_secret_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let debug = format!("{:?}", identity);
        assert!(!debug.contains(&nsec));
        assert!(!debug.contains(&secret_hex));
        assert!(debug.contains(&identity.display()));
        Ok(())
    }
}
