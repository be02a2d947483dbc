//! Length-prefixed frame codec.
//!
//! Encoding is a single buffer write: 4-byte big-endian payload length
//! followed by the JSON payload. Decoding is pull-based: feed raw socket
//! bytes into a [`FrameDecoder`] and drain complete messages out of it,
//! regardless of how the bytes were split across reads.

use crate::error::{ProtocolError, Result};
use crate::message::WireMessage;
use crate::{FRAME_HEADER_LEN, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message into a ready-to-write frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the serialized payload
/// exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg).map_err(ProtocolError::BadPayload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder with an internal receive buffer.
///
/// Bytes go in via [`extend`](Self::extend); complete messages come out via
/// [`next_frame`](Self::next_frame). A partial tail stays buffered until
/// more bytes arrive, so frames never tear across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete message, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A
    /// [`ProtocolError::BadPayload`] consumes exactly the offending frame;
    /// the decoder remains usable. A [`ProtocolError::FrameTooLarge`] means
    /// the length prefix cannot be trusted and the connection must close.
    ///
    /// # Errors
    ///
    /// See above; only `BadPayload` is recoverable.
    pub fn next_frame(&mut self) -> Result<Option<WireMessage>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let payload_len = u32::from_be_bytes(header) as usize;

        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { size: payload_len });
        }

        let frame_len = FRAME_HEADER_LEN + payload_len;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let parsed = serde_json::from_slice(&self.buf[FRAME_HEADER_LEN..frame_len]);
        // Consume the frame even when the payload is garbage; only the
        // length prefix delimits the stream.
        self.buf.drain(..frame_len);

        match parsed {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => Err(ProtocolError::BadPayload(e)),
        }
    }
}

/// Read one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns [`ProtocolError::ConnectionClosed`] if the peer disappears
/// mid-frame, [`ProtocolError::FrameTooLarge`] on an oversize prefix, and
/// [`ProtocolError::BadPayload`] on undecodable JSON.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;

    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::ConnectionClosed)
            };
        }
        filled += n;
    }

    let payload_len = u32::from_be_bytes(header) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { size: payload_len });
    }

    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        })?;

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(ProtocolError::BadPayload)
}

/// Write one frame to an async stream.
///
/// The length prefix and payload are emitted as one logical write;
/// `write_all` loops until every byte is drained or the socket errors.
///
/// # Errors
///
/// Returns an error if encoding fails or the socket write fails.
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
