//! Configuration
//!
//! An explicit value passed to whoever needs it; nothing reads a global.
//! Loaded from a JSON file, e.g. `~/.parley/config.json`:
//!
//! ```json
//! {
//!   "keyring_dir": "/home/alice/.parley/keyring",
//!   "database": "/home/alice/.parley/parley.db",
//!   "gpg_binary": "gpg2",
//!   "read_timeout_secs": 30,
//!   "local_address": { "host": "abc.onion", "port": 7473 }
//! }
//! ```
//!
//! Missing keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_crypto::agent::{DEFAULT_GPGCONF_BINARY, DEFAULT_GPG_BINARY};
use parley_crypto::GpgAgent;
use serde::{Deserialize, Serialize};

use crate::envelope::PeerAddress;
use crate::error::ConfigError;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PASSPHRASE_ENV: &str = "PARLEY_PASSPHRASE";
const HOME_DIR_NAME: &str = ".parley";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub home: PathBuf,
    /// Primary keyring (engine homedir).
    pub keyring_dir: PathBuf,
    pub database: PathBuf,
    pub gpg_binary: String,
    pub gpgconf_binary: String,
    /// Deadline for reading one frame from a peer.
    pub read_timeout_secs: u64,
    /// Our own message server address, advertised in envelopes.
    pub local_address: PeerAddress,
    /// Environment variable holding the session passphrase.
    pub passphrase_env: String,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(HOME_DIR_NAME);
        Self::rooted_at(home)
    }
}

impl ParleyConfig {
    /// Defaults with every path under `home`.
    pub fn rooted_at(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            keyring_dir: home.join("keyring"),
            database: home.join("parley.db"),
            home,
            gpg_binary: DEFAULT_GPG_BINARY.to_string(),
            gpgconf_binary: DEFAULT_GPGCONF_BINARY.to_string(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            local_address: PeerAddress::default(),
            passphrase_env: DEFAULT_PASSPHRASE_ENV.to_string(),
        }
    }

    /// `~/.parley/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(dirs::home_dir()
            .ok_or(ConfigError::NoHome)?
            .join(HOME_DIR_NAME)
            .join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Agent bound to the primary keyring.
    pub fn agent(&self) -> GpgAgent {
        GpgAgent::new(&self.keyring_dir).with_binaries(&self.gpg_binary, &self.gpgconf_binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::CryptoAgent;
    use tempfile::TempDir;

    #[test]
    fn test_missing_keys_take_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"gpg_binary": "gpg2", "read_timeout_secs": 5}"#).unwrap();

        let config = ParleyConfig::load(&path).unwrap();
        assert_eq!(config.gpg_binary, "gpg2");
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.gpgconf_binary, DEFAULT_GPGCONF_BINARY);
        assert_eq!(config.passphrase_env, DEFAULT_PASSPHRASE_ENV);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = ParleyConfig::rooted_at(dir.path());
        config.local_address = PeerAddress::new("abc.onion", 9000);
        config.save(&path).unwrap();

        assert_eq!(ParleyConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(ParleyConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_agent_uses_configured_paths() {
        let config = ParleyConfig::rooted_at("/tmp/parley-home");
        let agent = config.agent();
        assert_eq!(agent.keyring_dir(), Path::new("/tmp/parley-home/keyring"));
    }
}
