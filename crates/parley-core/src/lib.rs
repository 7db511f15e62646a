//! Parley Core - the envelope protocol
//!
//! Framing, typed envelopes, and the construction/validation pipelines
//! for contact requests, contact responses and messages. Storage is a
//! trait (`EnvelopeStore`); the crypto engine comes from `parley-crypto`.

pub mod config;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod inbox;
pub mod packet;
mod pipeline;
pub mod store;
pub mod stream;
pub mod validator;
pub mod worker;

pub use config::ParleyConfig;
pub use envelope::{
    AckPayload, ContactRequestData, ContactResponseData, ContactResponsePayload, MessageData,
    MessagePayload, PeerAddress,
};
pub use error::{ConfigError, EnvelopeError, PacketError, StoreError};
pub use factory::{
    BuiltContactRequest, BuiltContactResponse, BuiltMessage, ContactRequestFactory,
    ContactResponseFactory, MessageFactory,
};
pub use packet::{CommandTag, PacketHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use store::{
    ContactRequestRecord, EnvelopeStore, MemoryStore, PeerContact, PendingColumn,
    PendingResponse, ReceivedMessage, SentMessage,
};
pub use stream::Frame;
pub use validator::{
    ContactRequestValidator, ContactResponseValidator, MessageValidator, ValidContactRequest,
    ValidContactResponse, ValidMessage,
};
pub use worker::{process_frame, spawn_pipeline, EnvelopeEvent};
