use anyhow::{Context, Result};
use nostr::nips::nip19::ToBech32;
use nostr::Keys;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::SessionSettings;
use crate::directory::PeerDirectory;
use crate::error::Error;
use crate::identity::Identity;
use crate::relay::DEFAULT_RELAYS;
use crate::session::DEFAULT_STUN_SERVER;
use crate::signaling::{DEFAULT_DEDUP_CAPACITY, DEFAULT_RECENCY_WINDOW};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signals older than this many seconds are dropped
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    /// Per-relay wait for the OK message
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Event ids remembered for duplicate suppression
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// npubs allowed to call us. Empty = anyone.
    #[serde(default)]
    pub accept_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect()
}

fn default_recency_window_secs() -> u64 {
    DEFAULT_RECENCY_WINDOW.as_secs()
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}

fn default_stun_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: default_recency_window_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            dedup_capacity: default_dedup_capacity(),
            accept_from: Vec::new(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Config {
    /// Load config from ~/.nostr-call/config.toml, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, writing the defaults there if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to ~/.nostr-call/config.toml
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling.publish_timeout_ms)
    }

    /// Routing and acceptance settings for a session
    pub fn session_settings(&self) -> Result<SessionSettings> {
        let accept_from = PeerDirectory::resolve_all(&self.signaling.accept_from)
            .map_err(|e| Error::Config(format!("signaling.accept_from: {}", e)))?;
        if self.signaling.dedup_capacity == 0 {
            let reason = "signaling.dedup_capacity must be positive".to_string();
            return Err(Error::Config(reason).into());
        }

        Ok(SessionSettings {
            recency_window: Duration::from_secs(self.signaling.recency_window_secs),
            dedup_capacity: self.signaling.dedup_capacity,
            accept_from,
        })
    }
}

/// Get the app directory (~/.nostr-call)
pub fn get_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nostr-call")
}

/// Get the config file path (~/.nostr-call/config.toml)
pub fn get_config_path() -> PathBuf {
    get_app_dir().join("config.toml")
}

/// Get the nsec file path (~/.nostr-call/nsec)
pub fn get_nsec_path() -> PathBuf {
    get_app_dir().join("nsec")
}

/// Ensure nsec exists, generating one if not present
/// Returns (Identity, was_generated)
pub fn ensure_nsec() -> Result<(Identity, bool)> {
    ensure_nsec_at(&get_nsec_path())
}

pub fn ensure_nsec_at(path: &Path) -> Result<(Identity, bool)> {
    if path.exists() {
        Ok((read_nsec_at(path)?, false))
    } else {
        Ok((generate_nsec_at(path)?, true))
    }
}

/// Read an existing nsec (bech32 or hex)
pub fn read_nsec_at(path: &Path) -> Result<Identity> {
    let nsec_str = fs::read_to_string(path).context("Failed to read nsec file")?;
    Identity::from_secret(nsec_str.trim()).context("Invalid nsec format")
}

/// Generate new nsec and save to file
pub fn generate_nsec_at(path: &Path) -> Result<Identity> {
    write_nsec_at(path, Keys::generate())
}

/// Save `keys` as nsec, owner-readable only
pub fn write_nsec_at(path: &Path, keys: Keys) -> Result<Identity> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let nsec = keys
        .secret_key()
        .to_bech32()
        .context("Failed to encode nsec")?;

    fs::write(path, &nsec)?;

    // Set permissions to 0600 (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(Identity::from_keys(keys))
}
