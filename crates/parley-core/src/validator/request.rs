//! Contact request validation (no prior trust)

use parley_crypto::{CryptoAgent, DetachedSigCheck, KeyInfo, SigDict};

use super::{parse_sig_dict, payload_text};
use crate::envelope::{decode_json, ContactRequestData};
use crate::error::EnvelopeError;
use crate::pipeline::Outcome;

/// A contact request whose signature checks out against the key it carries.
#[derive(Debug, Clone)]
pub struct ValidContactRequest {
    pub contact_req: SigDict,
    pub nonce: String,
    pub data: ContactRequestData,
    pub key: KeyInfo,
}

pub struct ContactRequestValidator<'a, A: CryptoAgent> {
    agent: &'a A,
    payload: &'a [u8],
    outcome: Outcome<ValidContactRequest>,
}

impl<'a, A: CryptoAgent> ContactRequestValidator<'a, A> {
    /// `agent` is only a template; the claimed key is checked in an
    /// ephemeral keyring.
    pub fn new(agent: &'a A, payload: &'a [u8]) -> Self {
        Self {
            agent,
            payload,
            outcome: Outcome::Pending,
        }
    }

    pub fn validate(&mut self) -> bool {
        let (agent, payload) = (self.agent, self.payload);
        self.outcome.settle("contact-request", || run(agent, payload))
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn accepted(&self) -> Option<&ValidContactRequest> {
        self.outcome.value()
    }

    pub fn into_accepted(self) -> Option<ValidContactRequest> {
        self.outcome.into_value()
    }
}

fn run<A: CryptoAgent>(agent: &A, payload: &[u8]) -> Result<ValidContactRequest, EnvelopeError> {
    let sig_dict = parse_sig_dict(payload_text(payload)?)?;

    let data: ContactRequestData = decode_json(&sig_dict.data, "contact request data")?;
    tracing::debug!(nonce = %data.nonce, "contact request decoded");

    let check = DetachedSigCheck::check(agent, &data.gpg_pub_key, &sig_dict)?;
    if !check.is_valid() {
        return Err(EnvelopeError::KeyTrust(
            check.error().unwrap_or("signature check failed").to_string(),
        ));
    }
    let key = check
        .key()
        .cloned()
        .ok_or_else(|| EnvelopeError::KeyTrust("no key metadata".to_string()))?;

    Ok(ValidContactRequest {
        contact_req: sig_dict,
        nonce: data.nonce.clone(),
        data,
        key,
    })
}
