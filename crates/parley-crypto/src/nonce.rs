//! Nonce generation and digest helpers
//!
//! A nonce is the lowercase hex SHA-256 digest of the decimal text of a
//! random integer. Peers compare nonces as opaque strings, but other
//! components rely on the exact 64-character hex shape.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of a nonce in hex characters.
pub const NONCE_HEX_LEN: usize = 64;

/// Generate a fresh single-use nonce.
// TODO: the integer is bounded to 128 bits; revisit the entropy source in the
// next security review without changing the digest format.
pub fn generate_nonce() -> String {
    let value: u128 = rand::thread_rng().gen();
    sha256_hex(value.to_string().as_bytes())
}

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check a string has the shape of a nonce produced by [`generate_nonce`].
pub fn is_well_formed(nonce: &str) -> bool {
    nonce.len() == NONCE_HEX_LEN
        && nonce
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
