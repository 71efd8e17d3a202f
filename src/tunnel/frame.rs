//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |        Length (4B, big endian)    |
//! +--------+--------+--------+--------+
//! |  Type  |        Payload ...       |
//! +--------+--------+--------+--------+
//! ```
//!
//! `Length` counts the type byte plus the payload, so `1 <= Length <= 65536`.
//! There is no resynchronisation point: once a length is rejected the
//! surrounding stream must be abandoned.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest value the length field may carry
pub const MAX_FRAME_LEN: usize = 65536;

/// Maximum payload size (length field minus the type byte)
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_LEN - 1;

/// Largest encoded frame on the wire
pub const MAX_ENCODED_SIZE: usize = LENGTH_PREFIX_SIZE + MAX_FRAME_LEN;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// IP packet
    Data = 0,
    /// Keepalive probe
    Ping = 1,
    /// Keepalive response
    Pong = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Ping),
            2 => Ok(FrameType::Pong),
            other => Err(TunnelError::UnknownFrameType(other)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame of any type
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self { frame_type, payload }
    }

    /// Create a data frame carrying one packet
    pub fn data(payload: Bytes) -> Self {
        Self::new(FrameType::Data, payload)
    }

    /// Create a ping frame
    pub fn ping(payload: Bytes) -> Self {
        Self::new(FrameType::Ping, payload)
    }

    /// Create a pong frame echoing a ping's payload
    pub fn pong(payload: Bytes) -> Self {
        Self::new(FrameType::Pong, payload)
    }

    /// Encode frame to bytes
    ///
    /// The payload must not exceed [`MAX_PAYLOAD_SIZE`]; callers bound it by
    /// the adapter MTU.
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);

        let length = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length);

        buf.put_u32(length as u32);
        buf.put_u8(self.frame_type as u8);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. On error nothing is
    /// consumed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_length(length)?;

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[LENGTH_PREFIX_SIZE])?;

        buf.advance(LENGTH_PREFIX_SIZE + 1);
        let payload = buf.split_to(length - 1).freeze();

        Ok(Some(Self { frame_type, payload }))
    }

    /// Decode a buffer that must contain exactly one frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TunnelError> {
        let mut buf = BytesMut::from(bytes);
        match Self::decode(&mut buf)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(_) => Err(TunnelError::InvalidFrame(format!(
                "{} trailing bytes after frame",
                buf.len()
            ))),
            None => Err(TunnelError::Truncated),
        }
    }

    /// Read one frame from an async byte stream
    ///
    /// Returns `Ok(None)` if the stream ends cleanly on a frame boundary, and
    /// [`TunnelError::Truncated`] if it ends part-way through a frame.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(TunnelError::Truncated)
                };
            }
            filled += n;
        }

        let length = u32::from_be_bytes(len_buf) as usize;
        check_length(length)?;

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TunnelError::Truncated
            } else {
                TunnelError::Io(e)
            }
        })?;

        let frame_type = FrameType::try_from(body[0])?;
        let mut payload = Bytes::from(body);
        payload.advance(1);

        Ok(Some(Self { frame_type, payload }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + 1 + self.payload.len()
    }
}

fn check_length(length: usize) -> Result<(), TunnelError> {
    if length == 0 {
        return Err(TunnelError::InvalidFrame("zero length".to_string()));
    }
    if length > MAX_FRAME_LEN {
        return Err(TunnelError::FrameTooLarge(length, MAX_FRAME_LEN));
    }
    Ok(())
}
