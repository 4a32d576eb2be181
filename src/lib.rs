//! # bridgerpc
//!
//! Length-prefixed MessagePack RPC over an in-process native bridge.
//!
//! Every frame is a MessagePack unsigned integer holding the payload length,
//! followed by the payload: a call `[0, id, method, args]`, a response
//! `[1, id, error, result]` or a notification `[2, method, args]`.
//!
//! ```no_run
//! use bridgerpc::{Client, ClientConfig, ConnectionHooks, MemoryChannel, Value};
//!
//! let (local, remote) = MemoryChannel::pair();
//! let client = Client::bridge(local, ConnectionHooks::new(), ClientConfig::default()).unwrap();
//! let engine = Client::bridge(remote, ConnectionHooks::new(), ClientConfig::default()).unwrap();
//! engine.register_incoming_handler("ping", |_| Ok(Value::from("pong")));
//!
//! client.call("ping", vec![], |result| println!("{:?}", result));
//! ```

pub use bridgerpc_client::{
    handler_fn, BridgeTransport, ChannelError, ChannelObserver, Client, ClientConfig,
    ClientError, ConfigError, ConnectCallback, ConnectionHooks, ConnectionState, Dispatcher,
    IncomingHandler, MemoryChannel, MetaEvent, NativeChannel, ReconnectConfig,
    ReconnectingTransport, ResultCallback, Transport, TransportConfig,
};
pub use bridgerpc_protocol::{
    Decoder, Encoder, ErrorCode, Frame, Message, MessageId, MessageType, ProtocolError, RpcError,
    Value, MAX_PAYLOAD_SIZE,
};

pub mod logging {
    //! Log output setup.

    use tracing_subscriber::EnvFilter;

    /// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
    ///
    /// Does nothing if a global subscriber is already set.
    pub fn init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}
