//! Storage collaborator
//!
//! Validators and factories only read pending nonces and delete consumed
//! ones; the store is the single source of truth for the nonce registry.
//! `parley-memory` provides the SQLite implementation. `MemoryStore` here
//! is a process-local one for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::PeerAddress;
use crate::error::StoreError;

/// A contact request we sent and are awaiting a response to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResponse {
    pub nonce: String,
    /// Fingerprint of the peer the request was sent to.
    pub fingerprint: String,
    pub gpg_pub_key: String,
    pub address_host: Option<String>,
    pub address_port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Column a pending response can be deleted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingColumn {
    Nonce,
    Fingerprint,
}

impl PendingColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nonce => "nonce",
            Self::Fingerprint => "fingerprint",
        }
    }
}

/// An inbound contact request awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequestRecord {
    pub nonce: String,
    pub fingerprint: String,
    pub username: Option<String>,
    pub gpg_pub_key: String,
    pub address_host: Option<String>,
    pub address_port: Option<u16>,
    pub received_at: DateTime<Utc>,
}

impl ContactRequestRecord {
    pub fn address(&self) -> Option<PeerAddress> {
        Some(PeerAddress::new(self.address_host.clone()?, self.address_port?))
    }
}

/// A trusted contact, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContact {
    pub fingerprint: String,
    pub username: Option<String>,
    pub address_host: Option<String>,
    pub address_port: Option<u16>,
    pub gpg_pub_key: String,
    pub added_at: DateTime<Utc>,
}

impl PeerContact {
    pub fn address(&self) -> Option<PeerAddress> {
        Some(PeerAddress::new(self.address_host.clone()?, self.address_port?))
    }
}

/// Archived outbound message (ciphertext only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub nonce: String,
    pub sent_to: String,
    pub address_host: String,
    pub address_port: u16,
    pub ciphertext: String,
    pub sent_at: DateTime<Utc>,
}

/// Archived inbound message (ciphertext only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub nonce: String,
    pub sent_from: String,
    pub address_host: String,
    pub address_port: u16,
    pub ciphertext: String,
    pub received_at: DateTime<Utc>,
}

/// Typed storage operations the protocol needs.
pub trait EnvelopeStore: Send + Sync {
    /// Public key of the peer a pending request was sent to.
    fn fetch_pub_key_by_nonce(&self, nonce: &str) -> Result<Option<String>, StoreError>;

    fn fetch_all_pending_nonces(&self) -> Result<Vec<String>, StoreError>;

    fn insert_pending_response(&self, record: &PendingResponse) -> Result<(), StoreError>;

    /// Returns the number of rows removed.
    fn delete_pending_response_where(
        &self,
        column: PendingColumn,
        value: &str,
    ) -> Result<usize, StoreError>;

    fn fetch_peer_contact_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PeerContact>, StoreError>;

    /// Insert or replace by fingerprint.
    fn insert_peer_contact(&self, contact: &PeerContact) -> Result<(), StoreError>;

    fn list_peer_contacts(&self) -> Result<Vec<PeerContact>, StoreError>;

    fn insert_sent_message(&self, message: &SentMessage) -> Result<(), StoreError>;

    fn insert_received_message(&self, message: &ReceivedMessage) -> Result<(), StoreError>;

    fn received_message_exists(&self, nonce: &str) -> Result<bool, StoreError>;

    fn insert_contact_request(&self, record: &ContactRequestRecord) -> Result<(), StoreError>;

    fn fetch_contact_request(&self, nonce: &str)
        -> Result<Option<ContactRequestRecord>, StoreError>;

    fn list_contact_requests(&self) -> Result<Vec<ContactRequestRecord>, StoreError>;

    fn delete_contact_request(&self, nonce: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Tables {
    pending: BTreeMap<String, PendingResponse>,
    contacts: BTreeMap<String, PeerContact>,
    requests: BTreeMap<String, ContactRequestRecord>,
    sent: Vec<SentMessage>,
    received: Vec<ReceivedMessage>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn sent_messages(&self) -> Result<Vec<SentMessage>, StoreError> {
        Ok(self.lock()?.sent.clone())
    }

    pub fn received_messages(&self) -> Result<Vec<ReceivedMessage>, StoreError> {
        Ok(self.lock()?.received.clone())
    }
}

impl EnvelopeStore for MemoryStore {
    fn fetch_pub_key_by_nonce(&self, nonce: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.pending.get(nonce).map(|p| p.gpg_pub_key.clone()))
    }

    fn fetch_all_pending_nonces(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.pending.keys().cloned().collect())
    }

    fn insert_pending_response(&self, record: &PendingResponse) -> Result<(), StoreError> {
        self.lock()?
            .pending
            .insert(record.nonce.clone(), record.clone());
        Ok(())
    }

    fn delete_pending_response_where(
        &self,
        column: PendingColumn,
        value: &str,
    ) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;
        let before = tables.pending.len();
        tables.pending.retain(|_, p| match column {
            PendingColumn::Nonce => p.nonce != value,
            PendingColumn::Fingerprint => p.fingerprint != value,
        });
        Ok(before - tables.pending.len())
    }

    fn fetch_peer_contact_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PeerContact>, StoreError> {
        Ok(self.lock()?.contacts.get(fingerprint).cloned())
    }

    fn insert_peer_contact(&self, contact: &PeerContact) -> Result<(), StoreError> {
        self.lock()?
            .contacts
            .insert(contact.fingerprint.clone(), contact.clone());
        Ok(())
    }

    fn list_peer_contacts(&self) -> Result<Vec<PeerContact>, StoreError> {
        Ok(self.lock()?.contacts.values().cloned().collect())
    }

    fn insert_sent_message(&self, message: &SentMessage) -> Result<(), StoreError> {
        self.lock()?.sent.push(message.clone());
        Ok(())
    }

    fn insert_received_message(&self, message: &ReceivedMessage) -> Result<(), StoreError> {
        self.lock()?.received.push(message.clone());
        Ok(())
    }

    fn received_message_exists(&self, nonce: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.received.iter().any(|m| m.nonce == nonce))
    }

    fn insert_contact_request(&self, record: &ContactRequestRecord) -> Result<(), StoreError> {
        self.lock()?
            .requests
            .insert(record.nonce.clone(), record.clone());
        Ok(())
    }

    fn fetch_contact_request(
        &self,
        nonce: &str,
    ) -> Result<Option<ContactRequestRecord>, StoreError> {
        Ok(self.lock()?.requests.get(nonce).cloned())
    }

    fn list_contact_requests(&self) -> Result<Vec<ContactRequestRecord>, StoreError> {
        Ok(self.lock()?.requests.values().cloned().collect())
    }

    fn delete_contact_request(&self, nonce: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.requests.remove(nonce).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(nonce: &str, fingerprint: &str) -> PendingResponse {
        PendingResponse {
            nonce: nonce.to_string(),
            fingerprint: fingerprint.to_string(),
            gpg_pub_key: format!("key-{}", fingerprint),
            address_host: None,
            address_port: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_lifecycle() {
        let store = MemoryStore::new();
        store.insert_pending_response(&pending("n1", "F1")).unwrap();
        store.insert_pending_response(&pending("n2", "F1")).unwrap();
        store.insert_pending_response(&pending("n3", "F2")).unwrap();

        assert_eq!(store.fetch_pub_key_by_nonce("n3").unwrap().as_deref(), Some("key-F2"));
        assert_eq!(
            store.delete_pending_response_where(PendingColumn::Fingerprint, "F1").unwrap(),
            2
        );
        assert_eq!(store.fetch_all_pending_nonces().unwrap(), vec!["n3".to_string()]);
        assert_eq!(
            store.delete_pending_response_where(PendingColumn::Nonce, "n3").unwrap(),
            1
        );
        assert!(store.fetch_pub_key_by_nonce("n3").unwrap().is_none());
    }

    #[test]
    fn test_peer_contact_upsert() {
        let store = MemoryStore::new();
        let mut contact = PeerContact {
            fingerprint: "F1".to_string(),
            username: Some("Bob".to_string()),
            address_host: Some("old".to_string()),
            address_port: Some(1),
            gpg_pub_key: "key".to_string(),
            added_at: Utc::now(),
        };
        store.insert_peer_contact(&contact).unwrap();
        contact.address_host = Some("new".to_string());
        store.insert_peer_contact(&contact).unwrap();

        let contacts = store.list_peer_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].address().unwrap(), PeerAddress::new("new", 1));
    }
}
