//! Running pipelines off the async reactor
//!
//! Every engine call blocks on a subprocess, so validators and factories
//! run on tokio's blocking pool. Results come back as `EnvelopeEvent`s on
//! an mpsc channel, the way frontends consume agent events.

use parley_crypto::{CryptoAgent, SessionPassphrase};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::AckPayload;
use crate::error::EnvelopeError;
use crate::packet::CommandTag;
use crate::store::EnvelopeStore;
use crate::stream::Frame;
use crate::validator::{
    ContactRequestValidator, ContactResponseValidator, MessageValidator, ValidContactRequest,
    ValidContactResponse, ValidMessage,
};

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub enum EnvelopeEvent {
    ContactRequest(ValidContactRequest),
    ContactResponse(ValidContactResponse),
    Message(ValidMessage),
    /// Peer acknowledged one of our envelopes
    Ack(AckPayload),
    /// Built frame ready to send
    Built { tag: CommandTag, frame: Vec<u8> },
    Rejected {
        tag: CommandTag,
        error: EnvelopeError,
    },
    /// The pipeline task itself died
    Failed(String),
}

impl EnvelopeEvent {
    /// Acknowledgement to send back for an accepted envelope.
    pub fn ack(&self) -> Option<AckPayload> {
        let nonce = match self {
            Self::ContactRequest(v) => &v.nonce,
            Self::ContactResponse(v) => &v.data.response_nonce,
            Self::Message(v) => &v.data.nonce,
            _ => return None,
        };
        Some(AckPayload {
            nonce: nonce.clone(),
            accepted: true,
        })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Failed(_))
    }
}

fn rejected(tag: CommandTag, error: Option<&EnvelopeError>) -> EnvelopeEvent {
    EnvelopeEvent::Rejected {
        tag,
        error: error
            .cloned()
            .unwrap_or_else(|| EnvelopeError::Structural("rejected without a reason".to_string())),
    }
}

/// Validate one received frame with the validator its tag calls for.
pub fn process_frame<A: CryptoAgent>(
    agent: &A,
    store: &dyn EnvelopeStore,
    passphrase: &SessionPassphrase,
    frame: &Frame,
) -> EnvelopeEvent {
    let tag = frame.tag();
    tracing::debug!(tag = %tag, len = frame.payload.len(), "processing frame");
    match tag {
        CommandTag::Req => {
            let mut validator = ContactRequestValidator::new(agent, &frame.payload);
            if validator.validate() {
                validator
                    .into_accepted()
                    .map_or_else(|| rejected(tag, None), EnvelopeEvent::ContactRequest)
            } else {
                rejected(tag, validator.error())
            }
        }
        CommandTag::Res => {
            let mut validator =
                ContactResponseValidator::new(agent, store, passphrase, &frame.payload);
            if validator.validate() {
                validator
                    .into_accepted()
                    .map_or_else(|| rejected(tag, None), EnvelopeEvent::ContactResponse)
            } else {
                rejected(tag, validator.error())
            }
        }
        CommandTag::Msg => {
            let mut validator = MessageValidator::new(agent, passphrase, &frame.payload);
            if validator.validate() {
                validator
                    .into_accepted()
                    .map_or_else(|| rejected(tag, None), EnvelopeEvent::Message)
            } else {
                rejected(tag, validator.error())
            }
        }
        CommandTag::Ack => match frame.decode::<AckPayload>() {
            Ok(ack) => EnvelopeEvent::Ack(ack),
            Err(e) => EnvelopeEvent::Rejected {
                tag,
                error: e.into(),
            },
        },
    }
}

/// Run `job` on the blocking pool and deliver its event on `tx`.
pub fn spawn_pipeline<F>(tx: mpsc::Sender<EnvelopeEvent>, job: F) -> JoinHandle<()>
where
    F: FnOnce() -> EnvelopeEvent + Send + 'static,
{
    let task = tokio::task::spawn_blocking(job);
    tokio::spawn(async move {
        let event = match task.await {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "pipeline task failed");
                EnvelopeEvent::Failed(e.to_string())
            }
        };
        if tx.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;
    use crate::store::MemoryStore;
    use crate::stream::read_any_frame;
    use parley_crypto::GpgAgent;
    use serde_json::json;
    use std::io::Cursor;

    fn offline_agent() -> GpgAgent {
        GpgAgent::new("/nonexistent").with_binaries("/nonexistent/gpg", "/nonexistent/gpgconf")
    }

    fn frame(value: serde_json::Value, tag: CommandTag) -> Frame {
        let bytes = packet::encode(&value, tag).unwrap();
        read_any_frame(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_ack_frame_decodes() {
        let store = MemoryStore::new();
        let pass = SessionPassphrase::new("x").unwrap();
        let event = process_frame(
            &offline_agent(),
            &store,
            &pass,
            &frame(json!({"nonce": "n", "accepted": false}), CommandTag::Ack),
        );
        match event {
            EnvelopeEvent::Ack(ack) => assert!(!ack.accepted),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_response_nonce_never_reaches_engine() {
        // The engine binary doesn't exist: any decrypt attempt would surface
        // as a crypto error instead of a replay.
        let store = MemoryStore::new();
        let pass = SessionPassphrase::new("x").unwrap();
        let payload = json!({"ciphertext": "c", "request_nonce": "r", "response_nonce": "s"});
        let event = process_frame(&offline_agent(), &store, &pass, &frame(payload, CommandTag::Res));
        match event {
            EnvelopeEvent::Rejected { error, .. } => {
                assert!(matches!(error, EnvelopeError::Replay(_)), "{:?}", error)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_request_is_structural() {
        let store = MemoryStore::new();
        let pass = SessionPassphrase::new("x").unwrap();
        let event = process_frame(
            &offline_agent(),
            &store,
            &pass,
            &frame(json!({"sig": "s", "data": "d", "extra": 1}), CommandTag::Req),
        );
        assert!(event.is_rejected());
        assert!(event.ack().is_none());
    }

    #[tokio::test]
    async fn test_spawn_pipeline_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        spawn_pipeline(tx, || EnvelopeEvent::Built {
            tag: CommandTag::Msg,
            frame: vec![1, 2, 3],
        });
        match rx.recv().await {
            Some(EnvelopeEvent::Built { tag, frame }) => {
                assert_eq!(tag, CommandTag::Msg);
                assert_eq!(frame, vec![1, 2, 3]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_pipeline_reports_panics() {
        let (tx, mut rx) = mpsc::channel(1);
        spawn_pipeline(tx, || -> EnvelopeEvent { panic!("boom") });
        assert!(matches!(rx.recv().await, Some(EnvelopeEvent::Failed(_))));
    }
}
