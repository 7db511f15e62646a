//! Contact response construction
//!
//! The requester is not a trusted contact yet, so the response is
//! encrypted inside an ephemeral keyring holding only the requester's key.

use parley_crypto::nonce::generate_nonce;
use parley_crypto::{CryptoAgent, SessionPassphrase};

use super::{encode_sig_dict, ephemeral_import, sign_detached};
use crate::envelope::{encode_json, ContactResponseData, ContactResponsePayload, PeerAddress};
use crate::error::EnvelopeError;
use crate::packet::{self, CommandTag};
use crate::pipeline::Outcome;
use crate::store::ContactRequestRecord;

#[derive(Debug, Clone)]
pub struct BuiltContactResponse {
    pub payload: ContactResponsePayload,
    pub data: ContactResponseData,
    /// Requester fingerprint the response was encrypted to.
    pub recipient: String,
    /// Complete `RES` frame.
    pub frame: Vec<u8>,
}

pub struct ContactResponseFactory<'a, A: CryptoAgent> {
    address: &'a PeerAddress,
    agent: &'a A,
    request: &'a ContactRequestRecord,
    passphrase: &'a SessionPassphrase,
    signing_key: Option<&'a str>,
    outcome: Outcome<BuiltContactResponse>,
}

impl<'a, A: CryptoAgent> ContactResponseFactory<'a, A> {
    pub fn new(
        address: &'a PeerAddress,
        agent: &'a A,
        request: &'a ContactRequestRecord,
        passphrase: &'a SessionPassphrase,
    ) -> Self {
        Self {
            address,
            agent,
            request,
            passphrase,
            signing_key: None,
            outcome: Outcome::Pending,
        }
    }

    /// Sign with this key instead of the keyring's default.
    pub fn signing_key(mut self, fingerprint: &'a str) -> Self {
        self.signing_key = Some(fingerprint);
        self
    }

    pub fn build(&mut self) -> bool {
        let (address, agent, request, passphrase, signing_key) = (
            self.address,
            self.agent,
            self.request,
            self.passphrase,
            self.signing_key,
        );
        self.outcome.settle("contact-response-factory", || {
            run(address, agent, request, passphrase, signing_key)
        })
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn envelope(&self) -> Option<&BuiltContactResponse> {
        self.outcome.value()
    }

    pub fn into_envelope(self) -> Option<BuiltContactResponse> {
        self.outcome.into_value()
    }
}

fn run<A: CryptoAgent>(
    address: &PeerAddress,
    agent: &A,
    request: &ContactRequestRecord,
    passphrase: &SessionPassphrase,
    signing_key: Option<&str>,
) -> Result<BuiltContactResponse, EnvelopeError> {
    let response_nonce = generate_nonce();

    let data = ContactResponseData {
        address_host: address.host.clone(),
        address_port: address.port,
        response_nonce: response_nonce.clone(),
        request_nonce: request.nonce.clone(),
    };
    let encoded = encode_json(&data, "contact response data")?;

    let sig_dict = sign_detached(agent, encoded, signing_key, passphrase)?;
    let signed = encode_sig_dict(&sig_dict)?;

    let (mut ephemeral, recipient) = ephemeral_import(agent, &request.gpg_pub_key)?;
    let encrypted = ephemeral.agent().encrypt(&signed, &[recipient.as_str()])?;
    ephemeral.close()?;
    if !encrypted.ok {
        return Err(EnvelopeError::CryptoOperation(encrypted.status));
    }

    let payload = ContactResponsePayload {
        ciphertext: encrypted.ciphertext,
        request_nonce: request.nonce.clone(),
        response_nonce,
    };
    let frame = packet::encode(&payload, CommandTag::Res)?;
    tracing::debug!(request_nonce = %request.nonce, recipient = %recipient, "contact response built");

    Ok(BuiltContactResponse {
        payload,
        data,
        recipient,
        frame,
    })
}
