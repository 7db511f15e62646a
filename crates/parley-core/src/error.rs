//! Error taxonomy
//!
//! `EnvelopeError` is what a pipeline rejects untrusted input with. These
//! are expected outcomes and are reported as state on validators and
//! factories, not propagated as panics. The remaining enums are for
//! programmer or environment failures.

use parley_crypto::CryptoError;

/// Why an envelope was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Header unpack failure, tag mismatch, oversize or truncated read.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Required keys missing, or a payload that is not the expected JSON.
    #[error("Structural error: {0}")]
    Structural(String),

    /// The engine reported a failed encrypt, decrypt or sign.
    #[error("Crypto operation failed: {0}")]
    CryptoOperation(String),

    /// A candidate key failed single-fingerprint import, or a signature
    /// failed to verify against it.
    #[error("Key trust error: {0}")]
    KeyTrust(String),

    /// A nonce that is unknown, already consumed, or spliced.
    #[error("Replay rejected: {0}")]
    Replay(String),

    /// The store failed, or is missing state it should have.
    #[error("Store error: {0}")]
    Store(String),
}

impl EnvelopeError {
    /// Short stable name, used in logs and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Structural(_) => "structural",
            Self::CryptoOperation(_) => "crypto",
            Self::KeyTrust(_) => "key-trust",
            Self::Replay(_) => "replay",
            Self::Store(_) => "store",
        }
    }
}

impl From<CryptoError> for EnvelopeError {
    fn from(e: CryptoError) -> Self {
        Self::CryptoOperation(e.to_string())
    }
}

impl From<StoreError> for EnvelopeError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<PacketError> for EnvelopeError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::Io(_) | PacketError::TooLarge(_) => Self::Framing(e.to_string()),
            PacketError::Json(_) | PacketError::Utf8 => Self::Structural(e.to_string()),
        }
    }
}

/// Frame encode/decode failures.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    Utf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Invalid stored value in {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No home directory")]
    NoHome,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    Address(String),
}
