//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
///
/// Every variant is fatal to the channel it was raised on: once a frame
/// fails to decode the stream position of the next frame is unknown.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("invalid length prefix marker: {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("negative length prefix: {0}")]
    NegativeLength(i64),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(String),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),
}

impl ProtocolError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage(msg.into())
    }
}

/// Stable error codes carried in error responses.
///
/// The numeric values are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Generic,
    UnknownMethod,
    BadArguments,
    HandlerFailed,
    InternalError,
}

impl ErrorCode {
    /// Returns the numeric code sent on the wire.
    pub fn as_i64(&self) -> i64 {
        match self {
            ErrorCode::Generic => 1,
            ErrorCode::UnknownMethod => 2,
            ErrorCode::BadArguments => 3,
            ErrorCode::HandlerFailed => 4,
            ErrorCode::InternalError => 5,
        }
    }

    /// Maps a numeric wire code back to a known code.
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::Generic),
            2 => Some(ErrorCode::UnknownMethod),
            3 => Some(ErrorCode::BadArguments),
            4 => Some(ErrorCode::HandlerFailed),
            5 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }

    /// Returns the stable name sent alongside the code.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Generic => "GENERIC",
            ErrorCode::UnknownMethod => "UNKNOWN_METHOD",
            ErrorCode::BadArguments => "BAD_ARGUMENTS",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::Generic,
            ErrorCode::UnknownMethod,
            ErrorCode::BadArguments,
            ErrorCode::HandlerFailed,
            ErrorCode::InternalError,
        ] {
            assert_eq!(ErrorCode::from_i64(code.as_i64()), Some(code));
        }
        assert_eq!(ErrorCode::from_i64(0), None);
        assert_eq!(ErrorCode::from_i64(999), None);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::UnknownMethod), "UNKNOWN_METHOD");
        assert_eq!(format!("{}", ErrorCode::InternalError), "INTERNAL_ERROR");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidLengthPrefix(0xc1);
        assert!(err.to_string().contains("0xc1"));

        let err = ProtocolError::TrailingBytes(3);
        assert!(err.to_string().contains('3'));

        let err = ProtocolError::UnknownMessageType(9);
        assert!(err.to_string().contains('9'));
    }
}
