//! Parley Memory - SQLite storage
//!
//! Implements `parley_core::EnvelopeStore` over a single rusqlite
//! connection: pending nonces, contacts, inbound requests and the
//! ciphertext archive.

pub mod sqlite;

pub use sqlite::SqliteStore;
