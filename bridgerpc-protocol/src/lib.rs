//! # bridgerpc-protocol
//!
//! Wire protocol for bridgerpc.
//!
//! This crate provides:
//! - Binary framing with a MessagePack-encoded length prefix
//! - MessagePack envelopes for calls, responses and notifications
//! - A restartable stream decoder that tolerates arbitrary chunking
//! - Error types and stable RPC error codes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, Messages};
pub use error::{ErrorCode, ProtocolError};
pub use frame::Frame;
pub use message::{Message, MessageId, MessageType, RpcError};

pub use rmpv::Value;

/// Maximum frame payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;
