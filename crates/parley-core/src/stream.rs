//! Reading and writing frames on byte streams
//!
//! Readers collect exactly the declared number of bytes, looping over
//! short reads, and never consume anything past the end of the frame.
//! A peer that closes early yields a framing error.

use std::io::{ErrorKind, Read};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EnvelopeError, PacketError};
use crate::packet::{self, CommandTag, PacketHeader, HEADER_LEN};

/// A complete frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn tag(&self) -> CommandTag {
        self.header.tag
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        packet::decode_payload(&self.payload)
    }

    /// Re-encode header and payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Read exactly `n` bytes. `Ok(None)` if the stream ends first.
fn read_exactly<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(buf))
}

fn truncated(what: &str, want: usize) -> EnvelopeError {
    EnvelopeError::Framing(format!("peer closed before {} ({} bytes) was read", what, want))
}

fn bad_header(expected: Option<CommandTag>) -> EnvelopeError {
    match expected {
        Some(tag) => EnvelopeError::Framing(format!("invalid header, expected {}", tag)),
        None => EnvelopeError::Framing("invalid header".to_string()),
    }
}

fn check_header(bytes: &[u8], expected: Option<CommandTag>) -> Result<PacketHeader, EnvelopeError> {
    let header = match expected {
        Some(tag) => packet::decode_header(bytes, tag),
        None => PacketHeader::parse(bytes),
    };
    header.ok_or_else(|| bad_header(expected))
}

fn read_frame_inner<R: Read>(
    reader: &mut R,
    expected: Option<CommandTag>,
) -> Result<Frame, EnvelopeError> {
    let io = |e: std::io::Error| EnvelopeError::Framing(e.to_string());

    let head = read_exactly(reader, HEADER_LEN)
        .map_err(io)?
        .ok_or_else(|| truncated("header", HEADER_LEN))?;
    let header = check_header(&head, expected)?;

    let payload = read_exactly(reader, header.payload_len())
        .map_err(io)?
        .ok_or_else(|| truncated("payload", header.payload_len()))?;
    Ok(Frame { header, payload })
}

/// Blocking read of one frame that must carry `expected`.
///
/// There is no deadline here; set one on the socket
/// (`TcpStream::set_read_timeout`) if the peer is untrusted.
pub fn read_frame<R: Read>(reader: &mut R, expected: CommandTag) -> Result<Frame, EnvelopeError> {
    read_frame_inner(reader, Some(expected))
}

/// Blocking read of one frame of any known tag.
pub fn read_any_frame<R: Read>(reader: &mut R) -> Result<Frame, EnvelopeError> {
    read_frame_inner(reader, None)
}

async fn read_frame_async_inner<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: Option<CommandTag>,
) -> Result<Frame, EnvelopeError> {
    let eof = |what: &'static str, want: usize| {
        move |e: std::io::Error| {
            if e.kind() == ErrorKind::UnexpectedEof {
                truncated(what, want)
            } else {
                EnvelopeError::Framing(e.to_string())
            }
        }
    };

    let mut head = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut head)
        .await
        .map_err(eof("header", HEADER_LEN))?;
    let header = check_header(&head, expected)?;

    let mut payload = vec![0u8; header.payload_len()];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof("payload", header.payload_len()))?;
    Ok(Frame { header, payload })
}

/// Async read of one frame. `timeout` bounds header and payload together.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: Option<CommandTag>,
    timeout: Duration,
) -> Result<Frame, EnvelopeError> {
    match tokio::time::timeout(timeout, read_frame_async_inner(reader, expected)).await {
        Ok(result) => result,
        Err(_) => Err(EnvelopeError::Framing(format!(
            "frame not received within {}s",
            timeout.as_secs()
        ))),
    }
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
