//! Wire framing
//!
//! Every frame is a 7-byte header followed by a JSON payload:
//!
//! ```text
//! +----------------+-------------+---------------------+
//! | length: u32 LE | tag: 3 byte | payload: length B   |
//! +----------------+-------------+---------------------+
//! ```
//!
//! The tag is one of `REQ`, `RES`, `ACK`, `MSG`. The payload is UTF-8
//! JSON of at most 65535 bytes.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PacketError;

pub const HEADER_LEN: usize = 7;
pub const MAX_PAYLOAD_LEN: usize = 65535;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    /// Contact request
    Req,
    /// Contact response
    Res,
    /// Acknowledgement
    Ack,
    /// Message
    Msg,
}

impl CommandTag {
    pub const ALL: [CommandTag; 4] = [Self::Req, Self::Res, Self::Ack, Self::Msg];

    pub const fn as_bytes(self) -> &'static [u8; 3] {
        match self {
            Self::Req => b"REQ",
            Self::Res => b"RES",
            Self::Ack => b"ACK",
            Self::Msg => b"MSG",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Res => "RES",
            Self::Ack => "ACK",
            Self::Msg => "MSG",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_bytes() == bytes)
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.to_ascii_uppercase().as_bytes())
            .ok_or_else(|| format!("unknown command tag: {}", s))
    }
}

/// Unpacked frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub tag: CommandTag,
}

impl PacketHeader {
    /// Unpack a header of any known tag. `None` if `bytes` is not exactly
    /// a header, the tag is unknown, or the length is over the limit.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HEADER_LEN {
            return None;
        }
        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tag = CommandTag::from_bytes(&bytes[4..7])?;
        if length as usize > MAX_PAYLOAD_LEN {
            return None;
        }
        Some(Self { length, tag })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..].copy_from_slice(self.tag.as_bytes());
        out
    }
}

/// Serialize `payload` to JSON and frame it under `tag`.
pub fn encode<T: Serialize + ?Sized>(payload: &T, tag: CommandTag) -> Result<Vec<u8>, PacketError> {
    let body = serde_json::to_vec(payload)?;
    encode_raw(&body, tag)
}

/// Frame an already-encoded payload.
pub fn encode_raw(body: &[u8], tag: CommandTag) -> Result<Vec<u8>, PacketError> {
    if body.len() > MAX_PAYLOAD_LEN {
        return Err(PacketError::TooLarge(body.len()));
    }
    let header = PacketHeader {
        length: body.len() as u32,
        tag,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Unpack a header and require it to carry `expected`.
///
/// Returns `None` on any mismatch; a bad header from a peer is a normal
/// outcome, not an error.
pub fn decode_header(bytes: &[u8], expected: CommandTag) -> Option<PacketHeader> {
    let header = PacketHeader::parse(bytes)?;
    if header.tag != expected {
        tracing::debug!(expected = %expected, got = %header.tag, "frame tag mismatch");
        return None;
    }
    Some(header)
}

/// Decode a payload body as UTF-8 JSON.
pub fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, PacketError> {
    let text = std::str::from_utf8(body).map_err(|_| PacketError::Utf8)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_layout() {
        let frame = encode(&json!({"a": 1}), CommandTag::Msg).unwrap();
        let body = br#"{"a":1}"#;
        assert_eq!(&frame[..4], &(body.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..7], b"MSG");
        assert_eq!(&frame[7..], body);
    }

    #[test]
    fn test_decode_header_checks_tag() {
        let frame = encode(&json!({}), CommandTag::Req).unwrap();
        let header = decode_header(&frame[..HEADER_LEN], CommandTag::Req).unwrap();
        assert_eq!(header.length, 2);
        assert!(decode_header(&frame[..HEADER_LEN], CommandTag::Res).is_none());
    }

    #[test]
    fn test_decode_header_rejects_short_and_unknown() {
        assert!(decode_header(b"\x02\x00\x00\x00RE", CommandTag::Req).is_none());
        assert!(decode_header(b"\x02\x00\x00\x00XYZ", CommandTag::Req).is_none());
        assert!(decode_header(b"\x02\x00\x00\x00req", CommandTag::Req).is_none());
    }

    #[test]
    fn test_length_limit() {
        let mut header = (MAX_PAYLOAD_LEN as u32).to_le_bytes().to_vec();
        header.extend_from_slice(b"ACK");
        assert!(decode_header(&header, CommandTag::Ack).is_some());

        let mut header = (MAX_PAYLOAD_LEN as u32 + 1).to_le_bytes().to_vec();
        header.extend_from_slice(b"ACK");
        assert!(decode_header(&header, CommandTag::Ack).is_none());

        let big = vec![b'x'; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_raw(&big, CommandTag::Msg),
            Err(PacketError::TooLarge(n)) if n == MAX_PAYLOAD_LEN + 1
        ));
        assert!(encode_raw(&big[..MAX_PAYLOAD_LEN], CommandTag::Msg).is_ok());
    }

    #[test]
    fn test_decode_payload() {
        let value: serde_json::Value = decode_payload(br#"{"nonce":"n"}"#).unwrap();
        assert_eq!(value["nonce"], "n");
        assert!(matches!(
            decode_payload::<serde_json::Value>(&[0xff, 0xfe]),
            Err(PacketError::Utf8)
        ));
        assert!(matches!(
            decode_payload::<serde_json::Value>(b"{oops"),
            Err(PacketError::Json(_))
        ));
    }

    #[test]
    fn test_tag_from_str() {
        assert_eq!("msg".parse::<CommandTag>().unwrap(), CommandTag::Msg);
        assert!("FOO".parse::<CommandTag>().is_err());
    }
}
