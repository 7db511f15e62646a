//! Contact request construction
//!
//! Requests travel unencrypted: the peer cannot decrypt to us before it
//! has our key. The signed body carries that key.

use chrono::Utc;
use parley_crypto::nonce::generate_nonce;
use parley_crypto::{CryptoAgent, SessionPassphrase, SigDict};

use super::{ephemeral_import, sign_detached};
use crate::envelope::{encode_json, ContactRequestData, PeerAddress};
use crate::error::EnvelopeError;
use crate::packet::{self, CommandTag};
use crate::pipeline::Outcome;
use crate::store::PendingResponse;

#[derive(Debug, Clone)]
pub struct BuiltContactRequest {
    pub sig_dict: SigDict,
    pub data: ContactRequestData,
    /// Insert into the store once the frame is on its way.
    pub pending: PendingResponse,
    /// Complete `REQ` frame.
    pub frame: Vec<u8>,
}

impl BuiltContactRequest {
    pub fn nonce(&self) -> &str {
        &self.data.nonce
    }
}

pub struct ContactRequestFactory<'a, A: CryptoAgent> {
    address: &'a PeerAddress,
    agent: &'a A,
    local_fingerprint: &'a str,
    peer_pub_key: &'a str,
    peer_address: Option<&'a PeerAddress>,
    passphrase: &'a SessionPassphrase,
    outcome: Outcome<BuiltContactRequest>,
}

impl<'a, A: CryptoAgent> ContactRequestFactory<'a, A> {
    pub fn new(
        address: &'a PeerAddress,
        agent: &'a A,
        local_fingerprint: &'a str,
        peer_pub_key: &'a str,
        passphrase: &'a SessionPassphrase,
    ) -> Self {
        Self {
            address,
            agent,
            local_fingerprint,
            peer_pub_key,
            peer_address: None,
            passphrase,
            outcome: Outcome::Pending,
        }
    }

    /// Where the request is being sent; kept on the pending record.
    pub fn peer_address(mut self, address: &'a PeerAddress) -> Self {
        self.peer_address = Some(address);
        self
    }

    pub fn build(&mut self) -> bool {
        let inputs = Inputs {
            address: self.address,
            agent: self.agent,
            local_fingerprint: self.local_fingerprint,
            peer_pub_key: self.peer_pub_key,
            peer_address: self.peer_address,
            passphrase: self.passphrase,
        };
        self.outcome.settle("contact-request-factory", || run(inputs))
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn envelope(&self) -> Option<&BuiltContactRequest> {
        self.outcome.value()
    }

    pub fn into_envelope(self) -> Option<BuiltContactRequest> {
        self.outcome.into_value()
    }
}

struct Inputs<'a, A> {
    address: &'a PeerAddress,
    agent: &'a A,
    local_fingerprint: &'a str,
    peer_pub_key: &'a str,
    peer_address: Option<&'a PeerAddress>,
    passphrase: &'a SessionPassphrase,
}

fn run<A: CryptoAgent>(inputs: Inputs<'_, A>) -> Result<BuiltContactRequest, EnvelopeError> {
    let nonce = generate_nonce();

    let gpg_pub_key = inputs
        .agent
        .export_keys(&[inputs.local_fingerprint], false, None)?;
    if gpg_pub_key.trim().is_empty() {
        return Err(EnvelopeError::CryptoOperation(format!(
            "no public key for {}",
            inputs.local_fingerprint
        )));
    }

    let data = ContactRequestData {
        gpg_pub_key,
        nonce: nonce.clone(),
        address_host: Some(inputs.address.host.clone()),
        address_port: Some(inputs.address.port),
    };
    let encoded = encode_json(&data, "contact request data")?;

    let sig_dict = sign_detached(
        inputs.agent,
        encoded,
        Some(inputs.local_fingerprint),
        inputs.passphrase,
    )?;

    let (_validator, peer_fingerprint) = ephemeral_import(inputs.agent, inputs.peer_pub_key)?;

    let frame = packet::encode(&sig_dict, CommandTag::Req)?;
    tracing::debug!(nonce = %nonce, peer = %peer_fingerprint, "contact request built");

    Ok(BuiltContactRequest {
        pending: PendingResponse {
            nonce,
            fingerprint: peer_fingerprint,
            gpg_pub_key: inputs.peer_pub_key.to_string(),
            address_host: inputs.peer_address.map(|a| a.host.clone()),
            address_port: inputs.peer_address.map(|a| a.port),
            created_at: Utc::now(),
        },
        sig_dict,
        data,
        frame,
    })
}
