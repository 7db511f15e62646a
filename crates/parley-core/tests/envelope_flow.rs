//! End-to-end exchanges against the real engine, in throwaway keyrings.

mod common;

use std::io::Cursor;

use common::{gpg_or_skip, peer, Peer};
use parley_core::inbox;
use parley_core::stream::read_frame;
use parley_core::{
    CommandTag, ContactRequestFactory, ContactRequestValidator, ContactResponseFactory,
    ContactResponseValidator, EnvelopeError, EnvelopeStore, MessageFactory, MessageValidator,
};
use parley_crypto::{CryptoAgent, SessionPassphrase, SigDict};

/// Alice requests, Bob approves and responds, Alice accepts. Both end up
/// trusting each other.
fn introduce(alice: &Peer, bob: &Peer) -> Vec<u8> {
    let mut factory = ContactRequestFactory::new(
        &alice.address,
        &alice.agent,
        &alice.fingerprint,
        &bob.pub_key,
        &alice.pass,
    )
    .peer_address(&bob.address);
    assert!(factory.build(), "{:?}", factory.error());
    let request = factory.into_envelope().unwrap();
    alice.store.insert_pending_response(&request.pending).unwrap();

    let frame = read_frame(&mut Cursor::new(request.frame), CommandTag::Req).unwrap();
    let mut validator = ContactRequestValidator::new(&bob.agent, &frame.payload);
    assert!(validator.validate(), "{:?}", validator.error());
    let valid = validator.into_accepted().unwrap();
    assert_eq!(valid.key.fingerprint, alice.fingerprint);
    assert_eq!(valid.data.address(), Some(alice.address.clone()));

    inbox::record_contact_request(&bob.store, &valid).unwrap();
    let record = inbox::take_contact_request(&bob.store, &valid.nonce)
        .unwrap()
        .unwrap();
    inbox::approve_contact_request(&bob.store, &bob.agent, &record).unwrap();

    let mut factory = ContactResponseFactory::new(&bob.address, &bob.agent, &record, &bob.pass)
        .signing_key(&bob.fingerprint);
    assert!(factory.build(), "{:?}", factory.error());
    let response = factory.into_envelope().unwrap();
    assert_eq!(response.recipient, alice.fingerprint);

    let frame = read_frame(&mut Cursor::new(response.frame.clone()), CommandTag::Res).unwrap();
    let mut validator =
        ContactResponseValidator::new(&alice.agent, &alice.store, &alice.pass, &frame.payload);
    assert!(validator.validate(), "{:?}", validator.error());
    let valid = validator.into_accepted().unwrap();
    assert_eq!(valid.key.fingerprint, bob.fingerprint);

    let contact = inbox::accept_contact_response(&alice.store, &alice.agent, &valid).unwrap();
    assert_eq!(contact.address(), Some(bob.address.clone()));
    response.frame
}

#[test]
fn test_alice_and_bob() {
    if !gpg_or_skip() {
        return;
    }
    let alice = peer("Alice", "alicepass", 7001);
    let bob = peer("Bob", "bobpass", 7002);

    introduce(&alice, &bob);
    assert!(alice.store.fetch_all_pending_nonces().unwrap().is_empty());
    assert_eq!(alice.key_count(), 2);
    assert_eq!(bob.key_count(), 2);

    let mut factory = MessageFactory::new(
        &alice.address,
        &alice.agent,
        &bob.pub_key,
        &alice.fingerprint,
        "Hello world",
        &alice.pass,
    );
    assert!(factory.build(), "{:?}", factory.error());
    let message = factory.into_envelope().unwrap();
    assert_eq!(message.recipient(), Some(bob.fingerprint.as_str()));
    inbox::record_sent_message(&alice.store, &message, &bob.address).unwrap();

    let frame = read_frame(&mut Cursor::new(message.frame.clone()), CommandTag::Msg).unwrap();
    let mut validator = MessageValidator::new(&bob.agent, &bob.pass, &frame.payload);
    assert!(validator.validate(), "{:?}", validator.error());
    let valid = validator.into_accepted().unwrap();
    assert_eq!(valid.data.message, "Hello world");
    assert_eq!(valid.data.sent_from.as_deref(), Some(alice.fingerprint.as_str()));
    assert_eq!(valid.data.sent_to.as_deref(), Some(bob.fingerprint.as_str()));
    assert_eq!(valid.sender(), Some(alice.fingerprint.as_str()));
    assert_eq!(
        valid.verify_result.username.as_deref(),
        Some("Alice <alice@parley.test>")
    );

    let received = inbox::record_message(&bob.store, &bob.agent, &valid).unwrap();
    assert_eq!(received.sent_from, alice.fingerprint);
    // Same message delivered twice.
    assert!(matches!(
        inbox::record_message(&bob.store, &bob.agent, &valid),
        Err(EnvelopeError::Replay(_))
    ));
}

#[test]
fn test_wrong_passphrase() {
    if !gpg_or_skip() {
        return;
    }
    let alice = peer("Alice", "alicepass", 7001);
    let bob = peer("Bob", "bobpass", 7002);
    introduce(&alice, &bob);

    let wrong = SessionPassphrase::new("not-alicepass").unwrap();
    let mut factory = MessageFactory::new(
        &alice.address,
        &alice.agent,
        &bob.pub_key,
        &alice.fingerprint,
        "Hello Bob",
        &wrong,
    );
    assert!(!factory.build());
    assert!(matches!(factory.error(), Some(EnvelopeError::CryptoOperation(_))));

    let mut factory = MessageFactory::new(
        &alice.address,
        &alice.agent,
        &bob.pub_key,
        &alice.fingerprint,
        "Hello Bob",
        &alice.pass,
    );
    assert!(factory.build());
    let frame = factory.into_envelope().unwrap().frame;

    let wrong = SessionPassphrase::new("not-bobpass").unwrap();
    let mut validator = MessageValidator::new(&bob.agent, &wrong, &frame[7..]);
    assert!(!validator.validate());
    assert!(matches!(validator.error(), Some(EnvelopeError::CryptoOperation(_))));

    // The same frame opens with the right passphrase.
    let mut validator = MessageValidator::new(&bob.agent, &bob.pass, &frame[7..]);
    assert!(validator.validate(), "{:?}", validator.error());
    assert_eq!(validator.accepted().unwrap().data.message, "Hello Bob");
}

#[test]
fn test_untrusted_sender_message_rejected() {
    if !gpg_or_skip() {
        return;
    }
    let alice = peer("Alice", "alicepass", 7001);
    let bob = peer("Bob", "bobpass", 7002);

    // Alice trusts Bob, but Bob never approved Alice.
    let imported = alice.agent.import_keys(&bob.pub_key).unwrap();
    assert_eq!(imported.count(), 1);

    let mut factory = MessageFactory::new(
        &alice.address,
        &alice.agent,
        &bob.pub_key,
        &alice.fingerprint,
        "Hello Bob",
        &alice.pass,
    );
    assert!(factory.build(), "{:?}", factory.error());
    let frame = factory.into_envelope().unwrap().frame;

    let mut validator = MessageValidator::new(&bob.agent, &bob.pass, &frame[7..]);
    assert!(!validator.validate());
    assert!(matches!(validator.error(), Some(EnvelopeError::KeyTrust(_))));
}

#[test]
fn test_request_validation_keeps_primary_keyring_clean() {
    if !gpg_or_skip() {
        return;
    }
    let alice = peer("Alice", "alicepass", 7001);
    let bob = peer("Bob", "bobpass", 7002);

    let mut factory = ContactRequestFactory::new(
        &alice.address,
        &alice.agent,
        &alice.fingerprint,
        &bob.pub_key,
        &alice.pass,
    );
    assert!(factory.build());
    let frame = factory.into_envelope().unwrap().frame;

    let mut validator = ContactRequestValidator::new(&bob.agent, &frame[7..]);
    assert!(validator.validate());
    assert_eq!(bob.key_count(), 1);

    let garbage = SigDict::new("sig", r#"{"gpg_pub_key":"not a key","nonce":"n"}"#)
        .encode()
        .unwrap();
    let mut validator = ContactRequestValidator::new(&bob.agent, garbage.as_bytes());
    assert!(!validator.validate());
    assert!(matches!(validator.error(), Some(EnvelopeError::KeyTrust(_))));
    assert_eq!(bob.key_count(), 1);
}

#[test]
fn test_request_to_invalid_peer_key_fails() {
    if !gpg_or_skip() {
        return;
    }
    let alice = peer("Alice", "alicepass", 7001);
    let mut factory = ContactRequestFactory::new(
        &alice.address,
        &alice.agent,
        &alice.fingerprint,
        "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\nnope\n",
        &alice.pass,
    );
    assert!(!factory.build());
    assert!(matches!(factory.error(), Some(EnvelopeError::KeyTrust(_))));
    // Outcome is cached.
    assert!(!factory.build());
}
