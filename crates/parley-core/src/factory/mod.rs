//! Envelope factories
//!
//! The sending side of each exchange: build the signed body, sign it
//! detached, encrypt where the exchange calls for it, and frame the
//! result. `build()` runs once and caches the outcome like the
//! validators do.

mod message;
mod request;
mod response;

pub use message::{BuiltMessage, MessageFactory};
pub use request::{BuiltContactRequest, ContactRequestFactory};
pub use response::{BuiltContactResponse, ContactResponseFactory};

use parley_crypto::{CryptoAgent, PubKeyValidator, SessionPassphrase, SigDict};

use crate::envelope::encode_json;
use crate::error::EnvelopeError;

/// Detached-sign `data` and pair it with its signature.
fn sign_detached<A: CryptoAgent>(
    agent: &A,
    data: String,
    key_id: Option<&str>,
    passphrase: &SessionPassphrase,
) -> Result<SigDict, EnvelopeError> {
    let signed = agent.sign(&data, key_id, passphrase, true)?;
    if signed.fingerprint.is_none() || signed.data.is_empty() {
        return Err(EnvelopeError::CryptoOperation(format!(
            "signing failed: {}",
            last_line(&signed.stderr)
        )));
    }
    Ok(SigDict::new(signed.data, data))
}

/// Import `pub_key` into an ephemeral keyring and return it with the
/// key's fingerprint. The keyring stays open while the validator lives.
fn ephemeral_import<A: CryptoAgent>(
    agent: &A,
    pub_key: &str,
) -> Result<(PubKeyValidator<A>, String), EnvelopeError> {
    let validator = PubKeyValidator::run(agent, pub_key)?;
    match validator.fingerprint().map(str::to_string) {
        Some(fingerprint) if validator.is_valid() => Ok((validator, fingerprint)),
        _ => Err(EnvelopeError::KeyTrust(format!(
            "peer public key invalid: {}",
            validator.error().unwrap_or("unknown error")
        ))),
    }
}

fn encode_sig_dict(sig_dict: &SigDict) -> Result<String, EnvelopeError> {
    encode_json(sig_dict, "signed envelope")
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no diagnostics").trim()
}
