//! Envelope validators
//!
//! Each validator runs a linear, fail-fast pipeline over one untrusted
//! payload. `validate()` drives it once and caches the outcome; a
//! rejection is reported through `error()`, never as a panic or `Err`.
//! Validators are built fresh per envelope.

mod message;
mod request;
mod response;

pub use message::{MessageValidator, ValidMessage};
pub use request::{ContactRequestValidator, ValidContactRequest};
pub use response::{ContactResponseValidator, ValidContactResponse};

use parley_crypto::SigDict;

use crate::envelope::decode_json;
use crate::error::EnvelopeError;

fn payload_text(payload: &[u8]) -> Result<&str, EnvelopeError> {
    std::str::from_utf8(payload)
        .map_err(|_| EnvelopeError::Structural("payload is not valid UTF-8".to_string()))
}

fn parse_sig_dict(text: &str) -> Result<SigDict, EnvelopeError> {
    decode_json(text, "signed envelope")
}
