//! Encoder and decoder for framed messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a complete frame (prefix + payload).
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        let payload = message.encode_payload()?;
        Frame::new(payload).encode()
    }
}

/// Restartable stream decoder.
///
/// Bytes are fed in whatever chunks the channel delivers them; the decoder
/// keeps the undecoded remainder between calls.
pub struct Decoder {
    buffer: BytesMut,
    max_payload: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Creates a decoder that rejects frames declaring more than
    /// `max_payload` bytes.
    pub fn with_max_payload(max_payload: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_payload,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Appends `data` and returns an iterator over every message that is now
    /// complete.
    ///
    /// The iterator is lazy: messages are decoded as it is advanced, and
    /// anything not yet complete stays buffered for the next call. On a
    /// protocol error the buffer is cleared, the error is yielded, and the
    /// iterator ends.
    pub fn feed(&mut self, data: &[u8]) -> Messages<'_> {
        self.extend(data);
        Messages {
            decoder: self,
            failed: false,
        }
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_with_limit(&mut self.buffer, self.max_payload)
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Message::decode_payload(&frame.payload)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the configured payload limit.
    pub fn max_payload(&self) -> u64 {
        self.max_payload
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of messages decoded from a [`Decoder`] buffer.
pub struct Messages<'a> {
    decoder: &'a mut Decoder,
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.decode_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => {
                // Frame boundaries are lost; nothing left in the buffer is trustworthy.
                self.failed = true;
                self.decoder.clear();
                Some(Err(e))
            }
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::message::RpcError;
    use crate::ErrorCode;
    use proptest::prelude::*;
    use rmpv::Value;

    fn arb_value() -> BoxedStrategy<Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            "[a-z0-9 ]{0,24}".prop_map(|s| Value::from(s.as_str())),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Binary),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,8}", inner), 0..6).prop_map(|entries| {
                    Value::Map(
                        entries
                            .into_iter()
                            .map(|(k, v)| (Value::from(k.as_str()), v))
                            .collect(),
                    )
                }),
            ]
        })
        .boxed()
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let method = "[a-z]{1,12}(\\.[a-z]{1,12})?";
        let args = proptest::collection::vec(arb_value(), 0..4);
        prop_oneof![
            (any::<u64>(), method, args.clone())
                .prop_map(|(id, method, args)| Message::call(id, method, args)),
            (any::<u64>(), arb_value()).prop_map(|(id, result)| Message::ok(id, result)),
            (any::<u64>(), "[a-z ]{0,32}").prop_map(|(id, desc)| {
                Message::error(id, RpcError::new(ErrorCode::HandlerFailed, desc))
            }),
            (method, args).prop_map(|(method, args)| Message::notification(method, args)),
            Just(Message::Empty),
        ]
    }

    proptest! {
        #[test]
        fn roundtrip(msg in arb_message()) {
            let encoded = Encoder::encode(&msg).unwrap();
            let mut decoder = Decoder::new();
            let decoded: Vec<_> = decoder.feed(&encoded).collect::<Result<_, _>>().unwrap();
            prop_assert_eq!(decoded, vec![msg]);
        }

        #[test]
        fn fragmentation_invariance(
            msgs in proptest::collection::vec(arb_message(), 1..6),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut stream = Vec::new();
            for msg in &msgs {
                stream.extend_from_slice(&Encoder::encode(msg).unwrap());
            }

            let mut points: Vec<usize> = cuts.iter().map(|ix| ix.index(stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            for window in points.windows(2) {
                for result in decoder.feed(&stream[window[0]..window[1]]) {
                    decoded.push(result.unwrap());
                }
            }

            prop_assert_eq!(decoded, msgs);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
