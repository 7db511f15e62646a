//! Contact response validation
//!
//! Only responses to a request we actually sent get past the nonce check,
//! and nothing is decrypted before that.

use parley_crypto::{CryptoAgent, DetachedSigCheck, KeyInfo, SessionPassphrase, SigDict};

use super::{parse_sig_dict, payload_text};
use crate::envelope::{decode_json, ContactResponseData, ContactResponsePayload};
use crate::error::EnvelopeError;
use crate::pipeline::Outcome;
use crate::store::EnvelopeStore;

#[derive(Debug, Clone)]
pub struct ValidContactResponse {
    pub data: ContactResponseData,
    /// The responder's key, as recorded when the request was sent.
    pub key: KeyInfo,
    pub gpg_pub_key: String,
    pub sig_dict: SigDict,
}

pub struct ContactResponseValidator<'a, A: CryptoAgent> {
    agent: &'a A,
    store: &'a dyn EnvelopeStore,
    passphrase: &'a SessionPassphrase,
    payload: &'a [u8],
    outcome: Outcome<ValidContactResponse>,
}

impl<'a, A: CryptoAgent> ContactResponseValidator<'a, A> {
    pub fn new(
        agent: &'a A,
        store: &'a dyn EnvelopeStore,
        passphrase: &'a SessionPassphrase,
        payload: &'a [u8],
    ) -> Self {
        Self {
            agent,
            store,
            passphrase,
            payload,
            outcome: Outcome::Pending,
        }
    }

    pub fn validate(&mut self) -> bool {
        let (agent, store, passphrase, payload) =
            (self.agent, self.store, self.passphrase, self.payload);
        self.outcome
            .settle("contact-response", || run(agent, store, passphrase, payload))
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn accepted(&self) -> Option<&ValidContactResponse> {
        self.outcome.value()
    }

    pub fn into_accepted(self) -> Option<ValidContactResponse> {
        self.outcome.into_value()
    }
}

fn run<A: CryptoAgent>(
    agent: &A,
    store: &dyn EnvelopeStore,
    passphrase: &SessionPassphrase,
    payload: &[u8],
) -> Result<ValidContactResponse, EnvelopeError> {
    let envelope: ContactResponsePayload = decode_json(payload_text(payload)?, "contact response")?;

    let pending = store.fetch_all_pending_nonces()?;
    if !pending.iter().any(|n| n == &envelope.request_nonce) {
        return Err(EnvelopeError::Replay(format!(
            "no pending request for nonce {}",
            envelope.request_nonce
        )));
    }

    let decrypted = agent.decrypt(&envelope.ciphertext, passphrase)?;
    if !decrypted.ok {
        return Err(EnvelopeError::CryptoOperation(decrypted.status));
    }
    let sig_dict = parse_sig_dict(&decrypted.plaintext)?;

    let pub_key = store
        .fetch_pub_key_by_nonce(&envelope.request_nonce)?
        .ok_or_else(|| {
            EnvelopeError::Store(format!(
                "pending nonce {} has no recorded key",
                envelope.request_nonce
            ))
        })?;

    let check = DetachedSigCheck::check(agent, &pub_key, &sig_dict)?;
    if !check.is_valid() {
        return Err(EnvelopeError::KeyTrust(
            check.error().unwrap_or("signature check failed").to_string(),
        ));
    }
    let key = check
        .key()
        .cloned()
        .ok_or_else(|| EnvelopeError::KeyTrust("no key metadata".to_string()))?;

    let data: ContactResponseData = decode_json(&sig_dict.data, "contact response data")?;

    // The cleartext correlation fields must be the signed ones.
    if data.request_nonce != envelope.request_nonce || data.response_nonce != envelope.response_nonce
    {
        return Err(EnvelopeError::Replay(
            "signed nonces do not match the envelope".to_string(),
        ));
    }

    Ok(ValidContactResponse {
        data,
        key,
        gpg_pub_key: pub_key,
        sig_dict,
    })
}
