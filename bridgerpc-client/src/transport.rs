//! Transport abstraction shared by every channel variant.

use crate::channel::NativeChannel;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use bridgerpc_protocol::{Decoder, Encoder, Message, ProtocolError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Receives the outcome of a connect request.
pub type ConnectCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send + 'static>;

/// Connection lifecycle hook.
pub type HookFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; reached only through an explicit close.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Callbacks fired on connection edges.
///
/// Transports fire each hook once per transition, never for a state that is
/// already current.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    on_connect: Option<HookFn>,
    on_disconnect: Option<HookFn>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn with_on_disconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Runs `first` before the existing connect hook.
    pub(crate) fn prepend_on_connect(mut self, first: HookFn) -> Self {
        let existing = self.on_connect.take();
        self.on_connect = Some(Arc::new(move || {
            first();
            if let Some(ref hook) = existing {
                hook();
            }
        }));
        self
    }

    pub(crate) fn fire_connect(&self) {
        if let Some(ref hook) = self.on_connect {
            hook();
        }
    }

    pub(crate) fn fire_disconnect(&self) {
        if let Some(ref hook) = self.on_disconnect {
            hook();
        }
    }
}

impl fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Stateful duplex channel carrying framed messages.
///
/// The dispatcher and client only ever see this trait, so an always-connected
/// bridge and a reconnecting channel are interchangeable.
pub trait Transport: Send + Sync {
    /// Frames and writes `message`. Fails with `NotConnected` unless the
    /// transport is connected.
    fn try_send(&self, message: &Message) -> Result<(), ClientError>;

    /// Frames and writes `message`, returning false if it was not delivered
    /// to the channel.
    fn send(&self, message: &Message) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("send failed: {}", e);
                false
            }
        }
    }

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Establishes the connection. The callback runs immediately when the
    /// transport is already connected.
    fn connect(&self, callback: ConnectCallback);

    /// Shuts the transport down.
    fn close(&self);

    /// Asks the channel to reset.
    fn reset(&self);

    /// Number of logical connections established so far.
    fn generation(&self) -> u64;

    /// Dispatcher that receives this transport's inbound messages.
    fn dispatcher(&self) -> &Arc<Dispatcher>;
}

/// Framing and dispatch plumbing shared by the transport variants.
///
/// Owns the decoder buffer; no other transport instance ever sees it.
pub(crate) struct Link {
    pub(crate) channel: Arc<dyn NativeChannel>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    decoder: Mutex<Decoder>,
}

impl Link {
    pub(crate) fn new(
        channel: Arc<dyn NativeChannel>,
        dispatcher: Arc<Dispatcher>,
        max_payload: u64,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            decoder: Mutex::new(Decoder::with_max_payload(max_payload)),
        }
    }

    /// Frames `message` and writes it in a single channel write.
    pub(crate) fn write(&self, message: &Message) -> Result<(), ClientError> {
        let frame = Encoder::encode(message)?;
        self.channel.write(&frame)?;
        Ok(())
    }

    /// Decodes `data`, dispatches every complete message and writes back
    /// responses to incoming calls.
    ///
    /// Messages decoded before a protocol error are still dispatched. The
    /// decoder lock is released before dispatch so handlers and callbacks
    /// may re-enter the transport.
    pub(crate) fn ingest(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut messages = Vec::new();
        let mut failure = None;
        {
            let mut decoder = self.decoder.lock();
            for result in decoder.feed(data) {
                match result {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        for message in messages {
            if let Some(reply) = self.dispatcher.dispatch_incoming(message) {
                if let Err(e) = self.write(&reply) {
                    tracing::warn!(id = ?reply.id(), "failed to send response: {}", e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drops any partially received frame.
    pub(crate) fn clear(&self) {
        self.decoder.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.decoder.lock().buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::dispatcher::handler_fn;
    use bridgerpc_protocol::{Value, MAX_PAYLOAD_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn link(channel: &Arc<MemoryChannel>) -> Link {
        channel.start().unwrap();
        Link::new(channel.clone(), Arc::new(Dispatcher::new()), MAX_PAYLOAD_SIZE)
    }

    #[test]
    fn test_hooks_fire() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (c, d) = (connects.clone(), disconnects.clone());

        let hooks = ConnectionHooks::new()
            .with_on_connect(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_disconnect(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });

        hooks.fire_connect();
        hooks.fire_disconnect();
        hooks.fire_disconnect();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prepend_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());

        let hooks = ConnectionHooks::new()
            .with_on_connect(move || a.lock().push("user"))
            .prepend_on_connect(Arc::new(move || b.lock().push("flush")));
        hooks.fire_connect();

        assert_eq!(*order.lock(), vec!["flush", "user"]);
    }

    #[test]
    fn test_ingest_replies_to_calls() {
        let channel = MemoryChannel::new();
        let link = link(&channel);
        link.dispatcher
            .register_handler("echo", handler_fn(|args| Ok(Value::Array(args))));

        let call = Encoder::encode(&Message::call(5, "echo", vec![Value::from("hi")])).unwrap();
        link.ingest(&call).unwrap();

        let written = channel.take_written();
        assert_eq!(written.len(), 1);
        let mut decoder = Decoder::new();
        let reply = decoder.feed(&written[0]).next().unwrap().unwrap();
        assert_eq!(
            reply,
            Message::ok(5, Value::Array(vec![Value::from("hi")]))
        );
    }

    #[test]
    fn test_ingest_keeps_partial_frame() {
        let channel = MemoryChannel::new();
        let link = link(&channel);

        let call = Encoder::encode(&Message::notification("tick", vec![])).unwrap();
        link.ingest(&call[..2]).unwrap();
        assert_eq!(link.buffered(), 2);

        link.clear();
        assert_eq!(link.buffered(), 0);
    }

    #[test]
    fn test_ingest_dispatches_before_error() {
        let channel = MemoryChannel::new();
        let link = link(&channel);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        link.dispatcher.register_handler(
            "tick",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Nil)
            }),
        );

        let mut data = Encoder::encode(&Message::notification("tick", vec![]))
            .unwrap()
            .to_vec();
        data.extend_from_slice(&[0xc1]);

        assert!(link.ingest(&data).is_err());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(link.buffered(), 0);
    }
}
