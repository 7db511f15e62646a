//! Session passphrase - the secret that unlocks the local private key
//!
//! Held in process memory only, for the lifetime of one session. It is
//! handed to every sign/decrypt call explicitly and only exposed while it
//! is being written to the engine's stdin.

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

pub struct SessionPassphrase(SecretString);

impl SessionPassphrase {
    /// The engine takes the first stdin line as the passphrase, so line
    /// breaks (and any other control character) are refused.
    pub fn new(passphrase: impl Into<String>) -> Result<Self> {
        let mut passphrase = Zeroizing::new(passphrase.into());
        if passphrase.chars().any(char::is_control) {
            return Err(CryptoError::InvalidInput(
                "passphrase contains a control character",
            ));
        }
        Ok(Self(SecretString::new(std::mem::take(&mut *passphrase))))
    }

    /// Read the passphrase from an environment variable; `None` when unset.
    pub fn from_env(var: &str) -> Result<Option<Self>> {
        std::env::var(var).ok().map(Self::new).transpose()
    }

    /// Engine stdin prefix: the passphrase followed by a newline, scrubbed on drop.
    pub(crate) fn stdin_line(&self) -> Zeroizing<Vec<u8>> {
        let secret = self.0.expose_secret();
        let mut line = Zeroizing::new(Vec::with_capacity(secret.len() + 1));
        line.extend_from_slice(secret.as_bytes());
        line.push(b'\n');
        line
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SessionPassphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionPassphrase([REDACTED])")
    }
}
