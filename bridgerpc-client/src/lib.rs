//! # bridgerpc-client
//!
//! Call correlation, transports and the client facade for bridgerpc.
//!
//! This crate provides:
//! - A dispatcher matching responses to pending calls by id
//! - An always-connected bridge transport and a reconnecting transport
//! - Reconnect backoff with jitter on the ambient tokio runtime
//! - An in-memory channel for tests and demos

pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod reconnect;
pub mod transport;

pub use bridge::BridgeTransport;
pub use channel::{ChannelError, ChannelObserver, MemoryChannel, MetaEvent, NativeChannel};
pub use client::Client;
pub use config::{ClientConfig, ConfigError, ReconnectConfig, TransportConfig};
pub use dispatcher::{handler_fn, Dispatcher, IncomingHandler, ResultCallback};
pub use error::ClientError;
pub use reconnect::ReconnectingTransport;
pub use transport::{ConnectCallback, ConnectionHooks, ConnectionState, Transport};
