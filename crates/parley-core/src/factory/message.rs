//! Message construction
//!
//! Messages go to trusted contacts only, so encryption happens in the
//! primary keyring, to the recipient and to ourselves.

use parley_crypto::nonce::generate_nonce;
use parley_crypto::{CryptoAgent, SessionPassphrase};

use super::{encode_sig_dict, ephemeral_import, sign_detached};
use crate::envelope::{encode_json, MessageData, MessagePayload, PeerAddress};
use crate::error::EnvelopeError;
use crate::packet::{self, CommandTag};
use crate::pipeline::Outcome;

#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub payload: MessagePayload,
    pub data: MessageData,
    /// Complete `MSG` frame.
    pub frame: Vec<u8>,
}

impl BuiltMessage {
    pub fn nonce(&self) -> &str {
        &self.payload.nonce
    }

    pub fn recipient(&self) -> Option<&str> {
        self.data.sent_to.as_deref()
    }
}

pub struct MessageFactory<'a, A: CryptoAgent> {
    address: &'a PeerAddress,
    agent: &'a A,
    recipient_pub_key: &'a str,
    local_fingerprint: &'a str,
    message: &'a str,
    passphrase: &'a SessionPassphrase,
    outcome: Outcome<BuiltMessage>,
}

impl<'a, A: CryptoAgent> MessageFactory<'a, A> {
    pub fn new(
        address: &'a PeerAddress,
        agent: &'a A,
        recipient_pub_key: &'a str,
        local_fingerprint: &'a str,
        message: &'a str,
        passphrase: &'a SessionPassphrase,
    ) -> Self {
        Self {
            address,
            agent,
            recipient_pub_key,
            local_fingerprint,
            message,
            passphrase,
            outcome: Outcome::Pending,
        }
    }

    pub fn build(&mut self) -> bool {
        let (address, agent, recipient_pub_key, local_fingerprint, message, passphrase) = (
            self.address,
            self.agent,
            self.recipient_pub_key,
            self.local_fingerprint,
            self.message,
            self.passphrase,
        );
        self.outcome.settle("message-factory", || {
            let nonce = generate_nonce();
            let (_validator, sent_to) = ephemeral_import(agent, recipient_pub_key)?;

            let data = MessageData {
                address_host: address.host.clone(),
                address_port: address.port,
                nonce: nonce.clone(),
                sent_to: Some(sent_to.clone()),
                sent_from: Some(local_fingerprint.to_string()),
                message: message.to_string(),
            };
            let encoded = encode_json(&data, "message data")?;

            let sig_dict = sign_detached(agent, encoded, Some(local_fingerprint), passphrase)?;
            let signed = encode_sig_dict(&sig_dict)?;

            let encrypted = agent.encrypt(&signed, &[local_fingerprint, sent_to.as_str()])?;
            if !encrypted.ok {
                return Err(EnvelopeError::CryptoOperation(encrypted.status));
            }

            let payload = MessagePayload {
                ciphertext: encrypted.ciphertext,
                nonce,
            };
            let frame = packet::encode(&payload, CommandTag::Msg)?;
            tracing::debug!(nonce = %payload.nonce, to = %sent_to, "message built");
            Ok(BuiltMessage {
                payload,
                data,
                frame,
            })
        })
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn envelope(&self) -> Option<&BuiltMessage> {
        self.outcome.value()
    }

    pub fn into_envelope(self) -> Option<BuiltMessage> {
        self.outcome.into_value()
    }
}
