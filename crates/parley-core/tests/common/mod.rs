#![allow(dead_code)]

use parley_core::{MemoryStore, PeerAddress};
use parley_crypto::agent::{gpg_available, DEFAULT_GPG_BINARY};
use parley_crypto::{CryptoAgent, GpgAgent, SessionPassphrase};
use tempfile::TempDir;

/// One side of a conversation: its own keyring, identity and store.
pub struct Peer {
    _dir: TempDir,
    pub agent: GpgAgent,
    pub pass: SessionPassphrase,
    pub fingerprint: String,
    pub pub_key: String,
    pub address: PeerAddress,
    pub store: MemoryStore,
}

impl Peer {
    pub fn key_count(&self) -> usize {
        self.agent.list_keys(false).unwrap().len()
    }
}

pub fn gpg_or_skip() -> bool {
    if gpg_available(DEFAULT_GPG_BINARY) {
        true
    } else {
        eprintln!("skipping test: gpg not available");
        false
    }
}

pub fn peer(name: &str, passphrase: &str, port: u16) -> Peer {
    let dir = TempDir::new().unwrap();
    let agent = GpgAgent::new(dir.path().join("keyring"));
    agent.prepare_home().unwrap();

    let pass = SessionPassphrase::new(passphrase).unwrap();
    let email = format!("{}@parley.test", name.to_lowercase());
    let fingerprint = agent
        .gen_key(name, &email, Some(&pass))
        .expect("key generation failed");
    let pub_key = agent.export_keys(&[&fingerprint], false, None).unwrap();

    Peer {
        _dir: dir,
        agent,
        pass,
        fingerprint,
        pub_key,
        address: PeerAddress::new(format!("{}.onion", name.to_lowercase()), port),
        store: MemoryStore::new(),
    }
}
