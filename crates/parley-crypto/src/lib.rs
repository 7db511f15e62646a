//! Parley Crypto - OpenPGP capability layer
//!
//! This crate provides:
//! - A `CryptoAgent` capability trait and the `gpg`-backed `GpgAgent`
//! - Ephemeral keyrings for checking untrusted public keys
//! - Public key and detached signature validation
//! - Nonce generation and digest helpers
//! - The in-memory session passphrase

pub mod agent;
pub mod keyring;
pub mod nonce;
pub mod passphrase;
mod status;
pub mod validate;

pub use agent::{
    CryptoAgent, DecryptResult, EncryptResult, GpgAgent, ImportResult, KeyInfo, SignResult,
    VerifyResult,
};
pub use keyring::EphemeralKeyring;
pub use passphrase::SessionPassphrase;
pub use validate::{verify_sig_dict, DetachedSigCheck, PubKeyValidator, SigDict, SigDictError};

/// Errors raised by the engine plumbing itself.
///
/// Failures the engine *reports* (bad passphrase, unknown recipient, bad
/// signature) are returned as data on the result structs, not as errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine output was not valid UTF-8")]
    InvalidOutput,

    #[error("No recipients given")]
    NoRecipients,

    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
