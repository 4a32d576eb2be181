//! Binary frame format.
//!
//! A frame is a MessagePack-encoded unsigned integer followed by exactly that
//! many payload bytes:
//!
//! ```text
//! +-------------------------+---------------------------+
//! | length prefix           | payload                   |
//! | msgpack uint, 1-9 bytes | `length` bytes            |
//! +-------------------------+---------------------------+
//! ```
//!
//! The prefix uses the smallest MessagePack integer form on encode. Decoding
//! also accepts non-negative signed forms, since some encoders emit them.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmp::Marker;

/// Length prefix parsed from the head of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefix {
    /// Bytes occupied by the prefix itself.
    pub header_len: usize,
    /// Declared payload length.
    pub payload_len: u64,
}

impl LengthPrefix {
    /// Total frame size (prefix + payload).
    pub fn frame_len(&self) -> u64 {
        (self.header_len as u64).saturating_add(self.payload_len)
    }

    /// Parses the prefix at the start of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold the whole prefix.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        let width = match Marker::from_u8(first) {
            Marker::FixPos(n) => {
                return Ok(Some(Self {
                    header_len: 1,
                    payload_len: n as u64,
                }))
            }
            Marker::U8 | Marker::I8 => 1,
            Marker::U16 | Marker::I16 => 2,
            Marker::U32 | Marker::I32 => 4,
            Marker::U64 | Marker::I64 => 8,
            _ => return Err(ProtocolError::InvalidLengthPrefix(first)),
        };

        if buf.len() < 1 + width {
            return Ok(None);
        }

        let mut raw = [0u8; 8];
        raw[8 - width..].copy_from_slice(&buf[1..1 + width]);
        let unsigned = u64::from_be_bytes(raw);

        let payload_len = match Marker::from_u8(first) {
            Marker::I8 | Marker::I16 | Marker::I32 | Marker::I64 => {
                let signed = sign_extend(unsigned, width);
                if signed < 0 {
                    return Err(ProtocolError::NegativeLength(signed));
                }
                signed as u64
            }
            _ => unsigned,
        };

        Ok(Some(Self {
            header_len: 1 + width,
            payload_len,
        }))
    }
}

fn sign_extend(value: u64, width: usize) -> i64 {
    let shift = 64 - (width as u32 * 8);
    ((value << shift) as i64) >> shift
}

/// A single frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len() as u64;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(9 + self.payload.len());
        let mut writer = (&mut buf).writer();
        rmp::encode::write_uint(&mut writer, payload_len)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from bytes, enforcing [`MAX_PAYLOAD_SIZE`].
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with_limit(buf, MAX_PAYLOAD_SIZE)
    }

    /// Decodes a frame from bytes with a custom payload limit.
    ///
    /// The declared length is checked before waiting for the payload, so an
    /// oversized frame fails fast instead of growing the buffer.
    pub fn decode_with_limit(
        buf: &mut BytesMut,
        max_payload: u64,
    ) -> Result<Option<Self>, ProtocolError> {
        let Some(prefix) = LengthPrefix::peek(buf)? else {
            return Ok(None);
        };

        if prefix.payload_len > max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: prefix.payload_len,
                max: max_payload,
            });
        }

        if (buf.len() as u64) < prefix.frame_len() {
            return Ok(None);
        }

        buf.advance(prefix.header_len);
        let payload = buf.split_to(prefix.payload_len as usize).freeze();

        Ok(Some(Self { payload }))
    }
}
