//! Message validation (trusted sender)
//!
//! The signature is verified in the primary keyring: a sender whose key
//! was never promoted to a contact fails here.

use parley_crypto::{verify_sig_dict, CryptoAgent, SessionPassphrase, SigDict, VerifyResult};

use super::{parse_sig_dict, payload_text};
use crate::envelope::{decode_json, MessageData, MessagePayload};
use crate::error::EnvelopeError;
use crate::pipeline::Outcome;

#[derive(Debug, Clone)]
pub struct ValidMessage {
    pub data: MessageData,
    pub verify_result: VerifyResult,
    /// As received, for archiving.
    pub ciphertext: String,
    pub sig_dict: SigDict,
}

impl ValidMessage {
    /// Primary fingerprint of the verified sender.
    pub fn sender(&self) -> Option<&str> {
        self.verify_result.fingerprint.as_deref()
    }
}

pub struct MessageValidator<'a, A: CryptoAgent> {
    agent: &'a A,
    passphrase: &'a SessionPassphrase,
    payload: &'a [u8],
    outcome: Outcome<ValidMessage>,
}

impl<'a, A: CryptoAgent> MessageValidator<'a, A> {
    pub fn new(agent: &'a A, passphrase: &'a SessionPassphrase, payload: &'a [u8]) -> Self {
        Self {
            agent,
            passphrase,
            payload,
            outcome: Outcome::Pending,
        }
    }

    pub fn validate(&mut self) -> bool {
        let (agent, passphrase, payload) = (self.agent, self.passphrase, self.payload);
        self.outcome.settle("message", || run(agent, passphrase, payload))
    }

    pub fn error(&self) -> Option<&EnvelopeError> {
        self.outcome.error()
    }

    pub fn accepted(&self) -> Option<&ValidMessage> {
        self.outcome.value()
    }

    pub fn into_accepted(self) -> Option<ValidMessage> {
        self.outcome.into_value()
    }
}

fn run<A: CryptoAgent>(
    agent: &A,
    passphrase: &SessionPassphrase,
    payload: &[u8],
) -> Result<ValidMessage, EnvelopeError> {
    let envelope: MessagePayload = decode_json(payload_text(payload)?, "message")?;

    let decrypted = agent.decrypt(&envelope.ciphertext, passphrase)?;
    if !decrypted.ok {
        return Err(EnvelopeError::CryptoOperation(decrypted.status));
    }
    let sig_dict = parse_sig_dict(&decrypted.plaintext)?;

    let verify_result = verify_sig_dict(agent, &sig_dict)?;
    if !verify_result.valid {
        return Err(EnvelopeError::KeyTrust(format!(
            "signature check failed: {}",
            verify_result.status
        )));
    }

    let data: MessageData = decode_json(&sig_dict.data, "message data")?;

    if data.nonce != envelope.nonce {
        return Err(EnvelopeError::Replay(
            "signed nonce does not match the envelope".to_string(),
        ));
    }
    if let (Some(claimed), Some(actual)) = (&data.sent_from, &verify_result.fingerprint) {
        if claimed != actual {
            return Err(EnvelopeError::KeyTrust(format!(
                "message claims sender {} but was signed by {}",
                claimed, actual
            )));
        }
    }

    Ok(ValidMessage {
        data,
        verify_result,
        ciphertext: envelope.ciphertext,
        sig_dict,
    })
}
