//! MessagePack envelopes for calls, responses and notifications.
//!
//! Every payload is a single MessagePack array whose first element is the
//! message type:
//!
//! ```text
//! call:         [0, id, method, args]
//! response:     [1, id, error, result]
//! notification: [2, method, args]
//! ```
//!
//! A zero-length payload is an [`Message::Empty`] keepalive.

use crate::error::{ErrorCode, ProtocolError};
use rmpv::Value;
use std::fmt;

/// Deepest array/map nesting accepted in a payload.
const MAX_NESTING_DEPTH: usize = 128;

/// Correlation token linking a call to its response.
pub type MessageId = u64;

/// Message type discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call,
    Response,
    Notification,
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::Call => 0,
            MessageType::Response => 1,
            MessageType::Notification => 2,
        }
    }

    pub fn from_i64(tag: i64) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Notification),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Error details carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Numeric error code (see [`ErrorCode`]).
    pub code: i64,
    /// Human-readable description.
    pub desc: String,
    /// Stable error name.
    pub name: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, desc: impl Into<String>) -> Self {
        Self {
            code: code.as_i64(),
            desc: desc.into(),
            name: code.name().to_string(),
        }
    }

    /// Error returned to the remote side for a call nobody handles.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(
            ErrorCode::UnknownMethod,
            format!("unknown method: {}", method),
        )
    }

    /// Returns the known error code, if the numeric code maps to one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i64(self.code)
    }

    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("code"), Value::from(self.code)),
            (Value::from("desc"), Value::from(self.desc.as_str())),
            (Value::from("name"), Value::from(self.name.as_str())),
        ])
    }

    /// Parses the error slot of a response. `Nil` means success.
    ///
    /// Accepts the `{code, desc, name}` map form and a bare description
    /// string.
    pub fn from_value(value: Value) -> Result<Option<Self>, ProtocolError> {
        match value {
            Value::Nil => Ok(None),
            Value::String(s) => {
                let desc = s
                    .into_str()
                    .ok_or_else(|| ProtocolError::invalid("error string is not UTF-8"))?;
                Ok(Some(Self::new(ErrorCode::Generic, desc)))
            }
            Value::Map(entries) => {
                let mut err = Self::new(ErrorCode::Generic, "");
                for (key, val) in entries {
                    match key.as_str() {
                        Some("code") => {
                            err.code = val
                                .as_i64()
                                .ok_or_else(|| ProtocolError::invalid("error code is not an integer"))?;
                        }
                        Some("desc") => {
                            err.desc = val.as_str().unwrap_or_default().to_string();
                        }
                        Some("name") => {
                            err.name = val.as_str().unwrap_or_default().to_string();
                        }
                        _ => {}
                    }
                }
                Ok(Some(err))
            }
            other => Err(ProtocolError::invalid(format!(
                "unsupported error value: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.code, self.desc)
    }
}

impl std::error::Error for RpcError {}

/// One RPC unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response with the same id.
    Call {
        id: MessageId,
        method: String,
        args: Vec<Value>,
    },
    /// Result or error for an earlier call.
    Response {
        id: MessageId,
        result: Result<Value, RpcError>,
    },
    /// Fire-and-forget message, never answered.
    Notification { method: String, args: Vec<Value> },
    /// Zero-length payload.
    Empty,
}

impl Message {
    pub fn call(id: MessageId, method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Call {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn ok(id: MessageId, result: Value) -> Self {
        Message::Response {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: MessageId, error: RpcError) -> Self {
        Message::Response {
            id,
            result: Err(error),
        }
    }

    pub fn notification(method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            args,
        }
    }

    /// Returns the correlation id for calls and responses.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::Call { id, .. } | Message::Response { id, .. } => Some(*id),
            Message::Notification { .. } | Message::Empty => None,
        }
    }

    /// Returns the method name for calls and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Call { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } | Message::Empty => None,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Message::Call { .. } => Some(MessageType::Call),
            Message::Response { .. } => Some(MessageType::Response),
            Message::Notification { .. } => Some(MessageType::Notification),
            Message::Empty => None,
        }
    }

    /// Converts the message into its MessagePack envelope.
    ///
    /// Returns `None` for [`Message::Empty`], which has no envelope.
    pub fn to_value(&self) -> Option<Value> {
        let value = match self {
            Message::Call { id, method, args } => Value::Array(vec![
                Value::from(MessageType::Call.as_u8()),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
            Message::Response { id, result } => {
                let (error, result) = match result {
                    Ok(value) => (Value::Nil, value.clone()),
                    Err(err) => (err.to_value(), Value::Nil),
                };
                Value::Array(vec![
                    Value::from(MessageType::Response.as_u8()),
                    Value::from(*id),
                    error,
                    result,
                ])
            }
            Message::Notification { method, args } => Value::Array(vec![
                Value::from(MessageType::Notification.as_u8()),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
            Message::Empty => return None,
        };
        Some(value)
    }

    /// Parses a MessagePack envelope.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(ProtocolError::invalid(format!(
                    "envelope is not an array: {}",
                    other
                )))
            }
        };

        let mut fields = items.into_iter();
        let tag = fields
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ProtocolError::invalid("missing message type"))?;

        match MessageType::from_i64(tag)? {
            MessageType::Call => {
                let id = take_id(fields.next())?;
                let method = take_method(fields.next())?;
                let args = take_args(fields.next())?;
                Ok(Message::Call { id, method, args })
            }
            MessageType::Response => {
                let id = take_id(fields.next())?;
                let error = RpcError::from_value(fields.next().unwrap_or(Value::Nil))?;
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(fields.next().unwrap_or(Value::Nil)),
                };
                Ok(Message::Response { id, result })
            }
            MessageType::Notification => {
                let method = take_method(fields.next())?;
                let args = take_args(fields.next())?;
                Ok(Message::Notification { method, args })
            }
        }
    }

    /// Serializes the message into a frame payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::new();
        if let Some(value) = self.to_value() {
            rmpv::encode::write_value(&mut payload, &value)
                .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        }
        Ok(payload)
    }

    /// Deserializes a frame payload. The payload must hold exactly one value.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Ok(Message::Empty);
        }
        let mut cursor = payload;
        let value = rmpv::decode::read_value_with_max_depth(&mut cursor, MAX_NESTING_DEPTH)?;
        if !cursor.is_empty() {
            return Err(ProtocolError::TrailingBytes(cursor.len()));
        }
        Self::from_value(value)
    }
}

fn take_id(value: Option<Value>) -> Result<MessageId, ProtocolError> {
    value
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ProtocolError::invalid("missing or invalid message id"))
}

fn take_method(value: Option<Value>) -> Result<String, ProtocolError> {
    match value {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| ProtocolError::invalid("method name is not UTF-8")),
        _ => Err(ProtocolError::invalid("missing or invalid method name")),
    }
}

fn take_args(value: Option<Value>) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Some(Value::Array(args)) => Ok(args),
        None | Some(Value::Nil) => Ok(Vec::new()),
        // A single non-array argument is wrapped rather than rejected.
        Some(other) => Ok(vec![other]),
    }
}
