//! Envelope payloads
//!
//! The signed `data` bodies and the cleartext payloads that carry them.
//! Required keys are plain fields, so a missing key is a decode error;
//! optional keys default to `None`.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EnvelopeError};

/// Port assumed when an address is given without one.
pub const DEFAULT_PORT: u16 = 7473;

/// Signed body of a contact request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequestData {
    pub gpg_pub_key: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_port: Option<u16>,
}

impl ContactRequestData {
    pub fn address(&self) -> Option<PeerAddress> {
        Some(PeerAddress::new(self.address_host.clone()?, self.address_port?))
    }
}

/// Signed body of a contact response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactResponseData {
    pub address_host: String,
    pub address_port: u16,
    pub response_nonce: String,
    pub request_nonce: String,
}

/// Signed body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub address_host: String,
    pub address_port: u16,
    pub nonce: String,
    /// Recipient fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_to: Option<String>,
    /// Sender fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_from: Option<String>,
    pub message: String,
}

/// `RES` frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactResponsePayload {
    pub ciphertext: String,
    pub request_nonce: String,
    pub response_nonce: String,
}

/// `MSG` frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub ciphertext: String,
    pub nonce: String,
}

/// `ACK` frame payload: whether the envelope carrying `nonce` was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub nonce: String,
    pub accepted: bool,
}

/// Decode a JSON body, reporting failures as structural errors.
pub fn decode_json<T: DeserializeOwned>(text: &str, what: &str) -> Result<T, EnvelopeError> {
    serde_json::from_str(text).map_err(|e| EnvelopeError::Structural(format!("{}: {}", what, e)))
}

pub fn encode_json<T: Serialize>(value: &T, what: &str) -> Result<String, EnvelopeError> {
    serde_json::to_string(value)
        .map_err(|e| EnvelopeError::Structural(format!("{}: {}", what, e)))
}

/// Host and port of a peer's message server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for PeerAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    /// `host:port`, or a bare `host` on the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::Address("empty address".to_string()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Address(format!("bad port in {}", s)))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(ConfigError::Address(format!("missing host in {}", s))),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_address_is_optional() {
        let data: ContactRequestData =
            decode_json(r#"{"gpg_pub_key":"k","nonce":"n"}"#, "request").unwrap();
        assert!(data.address().is_none());

        let missing = decode_json::<ContactRequestData>(r#"{"nonce":"n"}"#, "request");
        assert!(matches!(missing, Err(EnvelopeError::Structural(_))));
    }

    #[test]
    fn test_response_requires_all_keys() {
        let partial = r#"{"address_host":"h","address_port":1,"response_nonce":"r"}"#;
        assert!(decode_json::<ContactResponseData>(partial, "response").is_err());
    }

    #[test]
    fn test_message_optional_fingerprints() {
        let text = r#"{"address_host":"h","address_port":9,"nonce":"n","message":"hi"}"#;
        let data: MessageData = decode_json(text, "message").unwrap();
        assert!(data.sent_to.is_none());
        assert_eq!(data.message, "hi");
    }

    #[test]
    fn test_peer_address_parse() {
        let addr: PeerAddress = "abc.onion:8080".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("abc.onion", 8080));

        let bare: PeerAddress = "abc.onion".parse().unwrap();
        assert_eq!(bare.port, DEFAULT_PORT);

        assert!("abc:notaport".parse::<PeerAddress>().is_err());
        assert!(":80".parse::<PeerAddress>().is_err());
        assert!("".parse::<PeerAddress>().is_err());
    }
}
