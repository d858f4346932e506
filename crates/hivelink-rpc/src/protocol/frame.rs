// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport framing for the two wire protocol versions.
//!
//! TCP is a stream protocol without message boundaries, so each version
//! defines its own delimiting:
//!
//! ```text
//! v1:  +-------+-----+------+----------------+-------------------+
//!      | magic | ver | rsvd | length (4B BE) | payload           |
//!      |  "HL" | 1B  |  1B  |                | length bytes      |
//!      +-------+-----+------+----------------+-------------------+
//!
//! v0:  one read of at most 64 KiB yields one complete message; the
//!      serialized envelope is self-delimiting and at most one request
//!      is in flight per connection.
//! ```
//!
//! The v1 length is bounded by the configured maximum frame size; the v0
//! message size is capped at [`V0_MAX_MESSAGE_SIZE`], which is the hard
//! upper bound on any v0 request or response.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic bytes opening every v1 frame.
pub const V1_MAGIC: [u8; 2] = *b"HL";

/// Protocol version byte carried in the v1 preamble.
pub const V1_VERSION: u8 = 1;

/// Size of the fixed v1 preamble (magic + version + reserved + length).
pub const V1_PREAMBLE_SIZE: usize = 8;

/// Maximum size of a v0 message (fixed read capacity, no length prefix).
pub const V0_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Framing and envelope decoding failures.
///
/// [`FrameError::is_decode`] separates protocol violations (which surface
/// as decode errors) from transport failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection at a message boundary.
    #[error("connection closed by peer")]
    Closed,

    /// Frame did not start with the expected magic bytes.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),

    /// Preamble carried an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Announced frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit {max}")]
    TooLarge {
        /// Announced payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Envelope payload could not be parsed.
    #[error("malformed envelope: {0}")]
    Envelope(String),
}

impl FrameError {
    /// True for protocol violations, false for transport failures.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Self::BadMagic(_) | Self::BadVersion(_) | Self::TooLarge { .. } | Self::Envelope(_)
        )
    }
}

/// Frame a payload with the v1 preamble.
pub fn encode_v1(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(V1_PREAMBLE_SIZE + payload.len());
    frame.extend_from_slice(&V1_MAGIC);
    frame.push(V1_VERSION);
    frame.push(0); // reserved
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read one v1 frame, returning its payload.
///
/// A clean EOF before the first preamble byte maps to [`FrameError::Closed`];
/// EOF anywhere else is an I/O error (truncated frame).
pub async fn read_v1<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut preamble = [0u8; V1_PREAMBLE_SIZE];
    match reader.read_exact(&mut preamble).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(FrameError::Io(e)),
    }

    if preamble[..2] != V1_MAGIC {
        return Err(FrameError::BadMagic([preamble[0], preamble[1]]));
    }
    if preamble[2] != V1_VERSION {
        return Err(FrameError::BadVersion(preamble[2]));
    }

    let len = u32::from_be_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]) as usize;
    if len > max_size {
        return Err(FrameError::TooLarge { len, max: max_size });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one v1 frame.
pub async fn write_v1<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_v1(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one v0 message: a single bounded read, no length prefix.
///
/// Returns [`FrameError::Closed`] on EOF. Messages that would exceed the
/// fixed capacity are truncated by the transport contract; v0 senders must
/// stay under [`V0_MAX_MESSAGE_SIZE`].
pub async fn read_v0<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; V0_MAX_MESSAGE_SIZE];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(FrameError::Closed);
    }
    buf.truncate(n);
    Ok(buf)
}

/// Write one v0 message (raw payload, bounded by the fixed capacity).
pub async fn write_v0<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > V0_MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: V0_MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn v1_roundtrip() {
        let frame = encode_v1(b"hello, fleet");
        assert_eq!(&frame[..2], b"HL");
        assert_eq!(frame[2], V1_VERSION);
        assert_eq!(&frame[4..8], &12u32.to_be_bytes());

        let mut cursor = Cursor::new(frame);
        let payload = read_v1(&mut cursor, 1024).await.unwrap();
        assert_eq!(payload, b"hello, fleet");
    }

    #[tokio::test]
    async fn v1_empty_payload() {
        let frame = encode_v1(b"");
        let mut cursor = Cursor::new(frame);
        let payload = read_v1(&mut cursor, 1024).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn v1_pipelined_frames() {
        let mut buf = encode_v1(b"first");
        buf.extend_from_slice(&encode_v1(b"second"));
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_v1(&mut cursor, 1024).await.unwrap(), b"first");
        assert_eq!(read_v1(&mut cursor, 1024).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn v1_bad_magic() {
        let mut frame = encode_v1(b"x");
        frame[0] = b'Z';
        let mut cursor = Cursor::new(frame);
        let err = read_v1(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(_)));
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn v1_bad_version() {
        let mut frame = encode_v1(b"x");
        frame[2] = 9;
        let mut cursor = Cursor::new(frame);
        let err = read_v1(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::BadVersion(9)));
    }

    #[tokio::test]
    async fn v1_too_large_rejected_before_alloc() {
        let frame = encode_v1(&vec![0u8; 64]);
        let mut cursor = Cursor::new(frame);
        let err = read_v1(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 64, max: 16 }));
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn v1_clean_eof_is_closed() {
        let mut cursor = Cursor::new(Vec::new());
        let err = read_v1(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
        assert!(!err.is_decode());
    }

    #[tokio::test]
    async fn v1_truncated_body_is_io_error() {
        let mut frame = encode_v1(b"hello");
        frame.truncate(frame.len() - 2);
        let mut cursor = Cursor::new(frame);
        let err = read_v1(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn v0_single_read_roundtrip() {
        let mut cursor = Cursor::new(b"{\"k\":1}".to_vec());
        let msg = read_v0(&mut cursor).await.unwrap();
        assert_eq!(msg, b"{\"k\":1}");
    }

    #[tokio::test]
    async fn v0_eof_is_closed() {
        let mut cursor = Cursor::new(Vec::new());
        let err = read_v0(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[tokio::test]
    async fn v0_write_respects_capacity() {
        let mut out = Cursor::new(Vec::new());
        let big = vec![0u8; V0_MAX_MESSAGE_SIZE + 1];
        let err = write_v0(&mut out, &big).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));

        write_v0(&mut out, b"small").await.unwrap();
        assert_eq!(out.into_inner(), b"small");
    }
}
