//! Client error types.

use crate::channel::ChannelError;
use bridgerpc_protocol::{ErrorCode, MessageId, ProtocolError, RpcError};
use thiserror::Error;

/// Errors delivered through a call's result callback.
///
/// `Clone` so a single channel failure can be fanned out to every pending
/// call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("no pending call with id {0}")]
    StalePendingId(MessageId),

    #[error("remote error: {0}")]
    Remote(RpcError),

    #[error("request timeout")]
    Timeout,

    #[error("transport closed")]
    Closed,

    #[error("channel error: {0}")]
    Channel(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected | ClientError::ConnectionLost | ClientError::Timeout
        )
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

impl From<ChannelError> for ClientError {
    fn from(err: ChannelError) -> Self {
        ClientError::Channel(err.to_string())
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        match err.error_code() {
            Some(ErrorCode::UnknownMethod) => {
                let method = err
                    .desc
                    .strip_prefix("unknown method: ")
                    .unwrap_or(&err.desc);
                ClientError::UnknownMethod(method.to_string())
            }
            _ => ClientError::Remote(err),
        }
    }
}
