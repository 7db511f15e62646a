//! SQLite envelope store
//!
//! One connection behind a mutex, WAL mode. Pending-nonce writes are
//! mirrored into `pending_responses_sync` in the same transaction and
//! nonce reads are served from the mirror. This assumes a single writer
//! process; other connections see the mirror eventually, not atomically.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use parley_core::error::StoreError;
use parley_core::store::{
    ContactRequestRecord, EnvelopeStore, PeerContact, PendingColumn, PendingResponse,
    ReceivedMessage, SentMessage,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pending_responses (
        nonce TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        gpg_pub_key TEXT NOT NULL,
        address_host TEXT,
        address_port INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pending_responses_sync (
        nonce TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS peer_contacts (
        fingerprint TEXT PRIMARY KEY,
        username TEXT,
        address_host TEXT,
        address_port INTEGER,
        gpg_pub_key TEXT NOT NULL,
        added_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS contact_requests (
        nonce TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        username TEXT,
        gpg_pub_key TEXT NOT NULL,
        address_host TEXT,
        address_port INTEGER,
        received_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sent_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        nonce TEXT NOT NULL,
        sent_to TEXT NOT NULL,
        address_host TEXT NOT NULL,
        address_port INTEGER NOT NULL,
        ciphertext TEXT NOT NULL,
        sent_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS received_messages (
        nonce TEXT PRIMARY KEY,
        sent_from TEXT NOT NULL,
        address_host TEXT NOT NULL,
        address_port INTEGER NOT NULL,
        ciphertext TEXT NOT NULL,
        received_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_fingerprint ON pending_responses(fingerprint);
    CREATE INDEX IF NOT EXISTS idx_received_sender ON received_messages(sent_from);";

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// SQLite-backed envelope store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create database dir: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Archived outbound messages, newest first.
    pub fn list_sent_messages(&self, limit: usize) -> Result<Vec<SentMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT nonce, sent_to, address_host, address_port, ciphertext, sent_at
                 FROM sent_messages ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SentMessage {
                    nonce: row.get(0)?,
                    sent_to: row.get(1)?,
                    address_host: row.get(2)?,
                    address_port: row.get(3)?,
                    ciphertext: row.get(4)?,
                    sent_at: timestamp(row, 5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Archived inbound messages, newest first.
    pub fn list_received_messages(&self, limit: usize) -> Result<Vec<ReceivedMessage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT nonce, sent_from, address_host, address_port, ciphertext, received_at
                 FROM received_messages ORDER BY received_at DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ReceivedMessage {
                    nonce: row.get(0)?,
                    sent_from: row.get(1)?,
                    address_host: row.get(2)?,
                    address_port: row.get(3)?,
                    ciphertext: row.get(4)?,
                    received_at: timestamp(row, 5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<PeerContact> {
    Ok(PeerContact {
        fingerprint: row.get(0)?,
        username: row.get(1)?,
        address_host: row.get(2)?,
        address_port: row.get(3)?,
        gpg_pub_key: row.get(4)?,
        added_at: timestamp(row, 5)?,
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ContactRequestRecord> {
    Ok(ContactRequestRecord {
        nonce: row.get(0)?,
        fingerprint: row.get(1)?,
        username: row.get(2)?,
        gpg_pub_key: row.get(3)?,
        address_host: row.get(4)?,
        address_port: row.get(5)?,
        received_at: timestamp(row, 6)?,
    })
}

const CONTACT_COLUMNS: &str =
    "fingerprint, username, address_host, address_port, gpg_pub_key, added_at";
const REQUEST_COLUMNS: &str =
    "nonce, fingerprint, username, gpg_pub_key, address_host, address_port, received_at";

impl EnvelopeStore for SqliteStore {
    fn fetch_pub_key_by_nonce(&self, nonce: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT gpg_pub_key FROM pending_responses WHERE nonce = ?1",
            params![nonce],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn fetch_all_pending_nonces(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT nonce FROM pending_responses_sync")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)
    }

    fn insert_pending_response(&self, record: &PendingResponse) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO pending_responses
             (nonce, fingerprint, gpg_pub_key, address_host, address_port, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.nonce,
                record.fingerprint,
                record.gpg_pub_key,
                record.address_host,
                record.address_port,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO pending_responses_sync (nonce, fingerprint) VALUES (?1, ?2)",
            params![record.nonce, record.fingerprint],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        tracing::debug!(nonce = %record.nonce, "pending response stored");
        Ok(())
    }

    fn delete_pending_response_where(
        &self,
        column: PendingColumn,
        value: &str,
    ) -> Result<usize, StoreError> {
        // Column names come from the enum, never from input.
        let column = column.as_str();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let removed = tx
            .execute(
                &format!("DELETE FROM pending_responses WHERE {} = ?1", column),
                params![value],
            )
            .map_err(db_err)?;
        tx.execute(
            &format!("DELETE FROM pending_responses_sync WHERE {} = ?1", column),
            params![value],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn fetch_peer_contact_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PeerContact>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM peer_contacts WHERE fingerprint = ?1", CONTACT_COLUMNS),
            params![fingerprint],
            contact_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_peer_contact(&self, contact: &PeerContact) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO peer_contacts
             (fingerprint, username, address_host, address_port, gpg_pub_key, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET
                username = excluded.username,
                address_host = excluded.address_host,
                address_port = excluded.address_port,
                gpg_pub_key = excluded.gpg_pub_key",
            params![
                contact.fingerprint,
                contact.username,
                contact.address_host,
                contact.address_port,
                contact.gpg_pub_key,
                contact.added_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn list_peer_contacts(&self) -> Result<Vec<PeerContact>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM peer_contacts ORDER BY added_at",
                CONTACT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], contact_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn insert_sent_message(&self, message: &SentMessage) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sent_messages
             (nonce, sent_to, address_host, address_port, ciphertext, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.nonce,
                message.sent_to,
                message.address_host,
                message.address_port,
                message.ciphertext,
                message.sent_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_received_message(&self, message: &ReceivedMessage) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO received_messages
             (nonce, sent_from, address_host, address_port, ciphertext, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.nonce,
                message.sent_from,
                message.address_host,
                message.address_port,
                message.ciphertext,
                message.received_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn received_message_exists(&self, nonce: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM received_messages WHERE nonce = ?1",
            params![nonce],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn insert_contact_request(&self, record: &ContactRequestRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO contact_requests ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                REQUEST_COLUMNS
            ),
            params![
                record.nonce,
                record.fingerprint,
                record.username,
                record.gpg_pub_key,
                record.address_host,
                record.address_port,
                record.received_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn fetch_contact_request(
        &self,
        nonce: &str,
    ) -> Result<Option<ContactRequestRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM contact_requests WHERE nonce = ?1", REQUEST_COLUMNS),
            params![nonce],
            request_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_contact_requests(&self) -> Result<Vec<ContactRequestRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM contact_requests ORDER BY received_at",
                REQUEST_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], request_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete_contact_request(&self, nonce: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM contact_requests WHERE nonce = ?1", params![nonce])
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn pending(nonce: &str, fingerprint: &str) -> PendingResponse {
        PendingResponse {
            nonce: nonce.to_string(),
            fingerprint: fingerprint.to_string(),
            gpg_pub_key: format!("key-{}", fingerprint),
            address_host: Some("bob.onion".to_string()),
            address_port: Some(7002),
            created_at: Utc::now(),
        }
    }

    fn mirror_count(store: &SqliteStore) -> i64 {
        store
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM pending_responses_sync", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_pending_nonces_and_mirror() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(tmp.path()).unwrap();

        store.insert_pending_response(&pending("n1", "F1")).unwrap();
        store.insert_pending_response(&pending("n2", "F1")).unwrap();
        store.insert_pending_response(&pending("n3", "F2")).unwrap();
        assert_eq!(mirror_count(&store), 3);

        let mut nonces = store.fetch_all_pending_nonces().unwrap();
        nonces.sort();
        assert_eq!(nonces, vec!["n1", "n2", "n3"]);
        assert_eq!(store.fetch_pub_key_by_nonce("n3").unwrap().as_deref(), Some("key-F2"));

        let removed = store
            .delete_pending_response_where(PendingColumn::Fingerprint, "F1")
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(mirror_count(&store), 1);

        store.delete_pending_response_where(PendingColumn::Nonce, "n3").unwrap();
        assert!(store.fetch_all_pending_nonces().unwrap().is_empty());
        assert!(store.fetch_pub_key_by_nonce("n3").unwrap().is_none());
    }

    #[test]
    fn test_contact_upsert_keeps_added_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut contact = PeerContact {
            fingerprint: "F1".to_string(),
            username: Some("Bob <bob@parley.test>".to_string()),
            address_host: Some("old.onion".to_string()),
            address_port: Some(1),
            gpg_pub_key: "key".to_string(),
            added_at: Utc::now(),
        };
        store.insert_peer_contact(&contact).unwrap();
        let added_at = contact.added_at;

        contact.address_host = Some("new.onion".to_string());
        contact.added_at = Utc::now() + chrono::Duration::hours(1);
        store.insert_peer_contact(&contact).unwrap();

        let fetched = store.fetch_peer_contact_by_fingerprint("F1").unwrap().unwrap();
        assert_eq!(fetched.address_host.as_deref(), Some("new.onion"));
        assert_eq!(fetched.added_at, added_at);
        assert_eq!(store.list_peer_contacts().unwrap().len(), 1);
        assert!(store.fetch_peer_contact_by_fingerprint("F2").unwrap().is_none());
    }

    #[test]
    fn test_contact_requests() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = ContactRequestRecord {
            nonce: "n".to_string(),
            fingerprint: "F".to_string(),
            username: None,
            gpg_pub_key: "key".to_string(),
            address_host: None,
            address_port: None,
            received_at: Utc::now(),
        };
        store.insert_contact_request(&record).unwrap();
        assert_eq!(store.fetch_contact_request("n").unwrap(), Some(record));
        assert_eq!(store.list_contact_requests().unwrap().len(), 1);
        assert!(store.delete_contact_request("n").unwrap());
        assert!(!store.delete_contact_request("n").unwrap());
    }

    #[test]
    fn test_message_archive() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(tmp.path()).unwrap();
        let received = ReceivedMessage {
            nonce: "m1".to_string(),
            sent_from: "F".to_string(),
            address_host: "alice.onion".to_string(),
            address_port: 7001,
            ciphertext: "-----BEGIN PGP MESSAGE-----".to_string(),
            received_at: Utc::now(),
        };
        assert!(!store.received_message_exists("m1").unwrap());
        store.insert_received_message(&received).unwrap();
        assert!(store.received_message_exists("m1").unwrap());
        // Nonce is the primary key.
        assert!(store.insert_received_message(&received).is_err());

        store
            .insert_sent_message(&SentMessage {
                nonce: "m2".to_string(),
                sent_to: "G".to_string(),
                address_host: "bob.onion".to_string(),
                address_port: 7002,
                ciphertext: "c".to_string(),
                sent_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(store.list_sent_messages(10).unwrap()[0].sent_to, "G");
        assert_eq!(store.list_received_messages(10).unwrap(), vec![received]);
    }

    #[test]
    fn test_reopen_persists() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = SqliteStore::open(tmp.path()).unwrap();
            store.insert_pending_response(&pending("n1", "F1")).unwrap();
        }
        let store = SqliteStore::open(tmp.path()).unwrap();
        assert_eq!(store.fetch_all_pending_nonces().unwrap(), vec!["n1"]);
    }
}
