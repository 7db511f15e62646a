//! Post-validation bookkeeping
//!
//! Validators never write to the store or the primary keyring. These
//! helpers are the caller's side of each exchange: promote a validated
//! key, consume or abandon a nonce, reconcile a sender, archive
//! ciphertext.

use chrono::Utc;
use parley_crypto::{CryptoAgent, KeyInfo};

use crate::envelope::PeerAddress;
use crate::error::EnvelopeError;
use crate::factory::BuiltMessage;
use crate::store::{
    ContactRequestRecord, EnvelopeStore, PeerContact, PendingColumn, ReceivedMessage, SentMessage,
};
use crate::validator::{ValidContactRequest, ValidContactResponse, ValidMessage};

/// Import `armored` into the primary keyring; it must be exactly `expected`.
fn promote_key<A: CryptoAgent>(agent: &A, armored: &str, expected: &str) -> Result<(), EnvelopeError> {
    // Unchanged keys are still reported as IMPORT_OK.
    let imported = agent.import_keys(armored)?;
    match imported.fingerprints.as_slice() {
        [only] if only == expected => Ok(()),
        _ => Err(EnvelopeError::KeyTrust(format!(
            "import into primary keyring yielded {} keys",
            imported.count()
        ))),
    }
}

fn contact_from_key(key: &KeyInfo, armored: &str, address: Option<PeerAddress>) -> PeerContact {
    PeerContact {
        fingerprint: key.fingerprint.clone(),
        username: key.username().map(str::to_string),
        address_host: address.as_ref().map(|a| a.host.clone()),
        address_port: address.as_ref().map(|a| a.port),
        gpg_pub_key: armored.to_string(),
        added_at: Utc::now(),
    }
}

/// A validated response completes our request: the responder becomes a
/// trusted contact and the request nonce is consumed.
pub fn accept_contact_response<A: CryptoAgent>(
    store: &dyn EnvelopeStore,
    agent: &A,
    validated: &ValidContactResponse,
) -> Result<PeerContact, EnvelopeError> {
    promote_key(agent, &validated.gpg_pub_key, &validated.key.fingerprint)?;

    let address = PeerAddress::new(
        validated.data.address_host.clone(),
        validated.data.address_port,
    );
    let contact = contact_from_key(&validated.key, &validated.gpg_pub_key, Some(address));
    store.insert_peer_contact(&contact)?;

    let removed =
        store.delete_pending_response_where(PendingColumn::Nonce, &validated.data.request_nonce)?;
    tracing::info!(
        fingerprint = %contact.fingerprint,
        nonces = removed,
        "contact added"
    );
    Ok(contact)
}

/// Drop a pending request nonce that will never be answered.
pub fn abandon_contact_request(store: &dyn EnvelopeStore, nonce: &str) -> Result<bool, EnvelopeError> {
    Ok(store.delete_pending_response_where(PendingColumn::Nonce, nonce)? > 0)
}

/// Keep a validated inbound request until the user approves or rejects it.
pub fn record_contact_request(
    store: &dyn EnvelopeStore,
    validated: &ValidContactRequest,
) -> Result<ContactRequestRecord, EnvelopeError> {
    let record = ContactRequestRecord {
        nonce: validated.nonce.clone(),
        fingerprint: validated.key.fingerprint.clone(),
        username: validated.key.username().map(str::to_string),
        gpg_pub_key: validated.data.gpg_pub_key.clone(),
        address_host: validated.data.address_host.clone(),
        address_port: validated.data.address_port,
        received_at: Utc::now(),
    };
    store.insert_contact_request(&record)?;
    Ok(record)
}

/// Fetch a stored request and remove it; each request is answered once.
pub fn take_contact_request(
    store: &dyn EnvelopeStore,
    nonce: &str,
) -> Result<Option<ContactRequestRecord>, EnvelopeError> {
    let record = store.fetch_contact_request(nonce)?;
    if record.is_some() {
        store.delete_contact_request(nonce)?;
    }
    Ok(record)
}

/// Approving a request trusts the requester: their key goes into the
/// primary keyring so later messages from them verify.
pub fn approve_contact_request<A: CryptoAgent>(
    store: &dyn EnvelopeStore,
    agent: &A,
    record: &ContactRequestRecord,
) -> Result<PeerContact, EnvelopeError> {
    promote_key(agent, &record.gpg_pub_key, &record.fingerprint)?;
    let contact = PeerContact {
        fingerprint: record.fingerprint.clone(),
        username: record.username.clone(),
        address_host: record.address_host.clone(),
        address_port: record.address_port,
        gpg_pub_key: record.gpg_pub_key.clone(),
        added_at: Utc::now(),
    };
    store.insert_peer_contact(&contact)?;
    Ok(contact)
}

/// Archive a validated message after rejecting a reused nonce and
/// reconciling the sender with the contact table.
pub fn record_message<A: CryptoAgent>(
    store: &dyn EnvelopeStore,
    agent: &A,
    validated: &ValidMessage,
) -> Result<ReceivedMessage, EnvelopeError> {
    let data = &validated.data;
    if store.received_message_exists(&data.nonce)? {
        return Err(EnvelopeError::Replay(format!(
            "message nonce {} already received",
            data.nonce
        )));
    }

    let sender = validated
        .sender()
        .ok_or_else(|| EnvelopeError::KeyTrust("verified message has no signer".to_string()))?
        .to_string();

    match store.fetch_peer_contact_by_fingerprint(&sender)? {
        Some(mut contact) => {
            if contact.address_host.as_deref() != Some(data.address_host.as_str())
                || contact.address_port != Some(data.address_port)
            {
                tracing::info!(fingerprint = %sender, "contact address updated");
                contact.address_host = Some(data.address_host.clone());
                contact.address_port = Some(data.address_port);
                store.insert_peer_contact(&contact)?;
            }
        }
        None => {
            let key = agent
                .list_keys(false)?
                .into_iter()
                .find(|k| k.fingerprint == sender)
                .ok_or_else(|| {
                    EnvelopeError::Store(format!("signer {} missing from keyring", sender))
                })?;
            let armored = agent.export_keys(&[sender.as_str()], false, None)?;
            let address = PeerAddress::new(data.address_host.clone(), data.address_port);
            store.insert_peer_contact(&contact_from_key(&key, &armored, Some(address)))?;
            tracing::info!(fingerprint = %sender, "contact registered from keyring");
        }
    }

    let message = ReceivedMessage {
        nonce: data.nonce.clone(),
        sent_from: sender,
        address_host: data.address_host.clone(),
        address_port: data.address_port,
        ciphertext: validated.ciphertext.clone(),
        received_at: Utc::now(),
    };
    store.insert_received_message(&message)?;
    Ok(message)
}

pub fn record_sent_message(
    store: &dyn EnvelopeStore,
    built: &BuiltMessage,
    to: &PeerAddress,
) -> Result<SentMessage, EnvelopeError> {
    let message = SentMessage {
        nonce: built.payload.nonce.clone(),
        sent_to: built.recipient().unwrap_or_default().to_string(),
        address_host: to.host.clone(),
        address_port: to.port,
        ciphertext: built.payload.ciphertext.clone(),
        sent_at: Utc::now(),
    };
    store.insert_sent_message(&message)?;
    Ok(message)
}
