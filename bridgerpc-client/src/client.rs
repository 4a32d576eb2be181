//! High-level client API.

use crate::bridge::BridgeTransport;
use crate::channel::NativeChannel;
use crate::config::{ClientConfig, TransportConfig};
use crate::dispatcher::{Dispatcher, IncomingHandler, ResultCallback};
use crate::error::ClientError;
use crate::reconnect::ReconnectingTransport;
use crate::transport::{ConnectionHooks, ConnectionState, Transport};
use bridgerpc_protocol::{Message, MessageId, RpcError, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Calls made while disconnected, waiting for the next connect edge.
///
/// A queued call already holds its pending entry, so it can time out or be
/// cancelled before it is ever written.
struct Outbox {
    dispatcher: Arc<Dispatcher>,
    transport: OnceLock<Weak<dyn Transport>>,
    queued: Mutex<VecDeque<(MessageId, Message)>>,
}

impl Outbox {
    fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            transport: OnceLock::new(),
            queued: Mutex::new(VecDeque::new()),
        })
    }

    /// Runs the flush before the caller's own connect hook.
    fn wire(self: &Arc<Self>, hooks: ConnectionHooks) -> ConnectionHooks {
        let outbox = Arc::downgrade(self);
        hooks.prepend_on_connect(Arc::new(move || {
            if let Some(outbox) = outbox.upgrade() {
                outbox.flush();
            }
        }))
    }

    fn push(&self, id: MessageId, message: Message) {
        self.queued.lock().push_back((id, message));
    }

    fn remove(&self, id: MessageId) {
        self.queued.lock().retain(|(queued, _)| *queued != id);
    }

    fn flush(&self) {
        let Some(transport) = self.transport.get().and_then(Weak::upgrade) else {
            return;
        };
        let queued: Vec<(MessageId, Message)> = self.queued.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }

        tracing::debug!("flushing {} queued calls", queued.len());
        for (id, message) in queued {
            // Timed out or cancelled while queued.
            if !self.dispatcher.is_pending(id) {
                continue;
            }
            if let Err(e) = transport.try_send(&message) {
                fail_send(&self.dispatcher, id, e);
            }
        }
    }

    /// Drops every queued call, failing it with `error`.
    fn fail_all(&self, error: ClientError) -> usize {
        let queued: Vec<(MessageId, Message)> = self.queued.lock().drain(..).collect();
        queued
            .into_iter()
            .filter(|(id, _)| self.dispatcher.cancel(*id, error.clone()))
            .count()
    }

    fn len(&self) -> usize {
        self.queued.lock().len()
    }
}

/// Resolves a call whose envelope could not be written.
fn fail_send(dispatcher: &Dispatcher, id: MessageId, error: ClientError) {
    tracing::debug!(id, "send failed: {}", error);
    let error = match error {
        ClientError::Protocol(_) => error,
        _ => ClientError::NotConnected,
    };
    dispatcher.cancel(id, error);
}

/// RPC client over a native channel.
///
/// All call outcomes are delivered through the call's callback (or the
/// returned future for [`Client::call_async`]), never by panicking or
/// blocking.
pub struct Client {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    outbox: Arc<Outbox>,
    config: ClientConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl Client {
    /// Creates a client over an always-connected bridge and starts the
    /// channel.
    pub fn bridge(
        channel: Arc<dyn NativeChannel>,
        hooks: ConnectionHooks,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let outbox = Outbox::new(dispatcher.clone());
        let transport = BridgeTransport::new(
            channel,
            dispatcher.clone(),
            outbox.wire(hooks),
            config.transport.max_payload_bytes,
        );
        transport.start()?;
        Ok(Self::assemble(transport, dispatcher, outbox, config))
    }

    /// Creates a client over a channel that can drop. The client starts
    /// disconnected; call [`Client::connect`].
    pub fn reconnecting(
        channel: Arc<dyn NativeChannel>,
        hooks: ConnectionHooks,
        config: ClientConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let outbox = Outbox::new(dispatcher.clone());
        let transport = ReconnectingTransport::new(
            channel,
            dispatcher.clone(),
            outbox.wire(hooks),
            config.reconnect.clone(),
            config.transport.max_payload_bytes,
        );
        Self::assemble(transport, dispatcher, outbox, config)
    }

    fn assemble(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        outbox: Arc<Outbox>,
        config: ClientConfig,
    ) -> Self {
        let _ = outbox.transport.set(Arc::downgrade(&transport));
        let sweeper = spawn_sweeper(&dispatcher, &config.transport);
        Self {
            transport,
            dispatcher,
            outbox,
            config,
            sweeper,
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Issues a call. `callback` receives the result exactly once.
    pub fn call<F>(&self, method: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, ClientError>) + Send + 'static,
    {
        self.submit(method, args, Box::new(callback));
    }

    /// Issues a call and waits for its result, bounded by the configured
    /// request timeout.
    pub async fn call_async(&self, method: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        let id = self.submit(
            method,
            args,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let received = match self.config.transport.request_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(id) = id {
                        self.outbox.remove(id);
                        self.dispatcher.cancel(id, ClientError::Timeout);
                    }
                    tracing::debug!(method, "call timed out");
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };

        received.unwrap_or(Err(ClientError::ConnectionLost))
    }

    /// Registers (and possibly sends) a call. Returns its id unless it was
    /// rejected outright.
    fn submit(&self, method: &str, args: Vec<Value>, callback: ResultCallback) -> Option<MessageId> {
        match self.transport.state() {
            ConnectionState::Connected => {
                let (id, message) = self.dispatcher.register_call(method, args, callback);
                if let Err(e) = self.transport.try_send(&message) {
                    fail_send(&self.dispatcher, id, e);
                }
                Some(id)
            }
            ConnectionState::Closed => {
                callback(Err(ClientError::Closed));
                None
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if !self.config.transport.queue_until_connected {
                    callback(Err(ClientError::NotConnected));
                    return None;
                }

                let (id, message) = self.dispatcher.register_call(method, args, callback);
                self.outbox.push(id, message);
                tracing::debug!(id, method, "queued call until connected");

                // The connect edge may have passed between the state check
                // and the push.
                if self.transport.is_connected() {
                    self.outbox.flush();
                }
                Some(id)
            }
        }
    }

    /// Sends a notification. Delivery failures are only logged.
    pub fn notify(&self, method: &str, args: Vec<Value>) {
        let message = Message::notification(method, args);
        if let Err(e) = self.transport.try_send(&message) {
            tracing::warn!(method, "notification not delivered: {}", e);
        }
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Registers a handler for calls and notifications from the remote
    /// side. A later registration for the same method wins.
    pub fn register_incoming_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.dispatcher.register_handler(method, Arc::new(handler));
    }

    /// Registers a method-aware handler.
    pub fn register_handler(&self, method: &str, handler: Arc<dyn IncomingHandler>) {
        self.dispatcher.register_handler(method, handler);
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub fn connect<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), ClientError>) + Send + 'static,
    {
        self.transport.connect(Box::new(callback));
    }

    /// Connects and waits for the outcome of the attempt.
    pub async fn connect_async(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.connect(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Closes the transport and fails queued calls with `Closed`.
    pub fn close(&self) {
        self.transport.close();
        let failed = self.outbox.fail_all(ClientError::Closed);
        if failed > 0 {
            tracing::debug!("failed {} queued calls on close", failed);
        }
    }

    /// Asks the native side to reset the channel.
    pub fn reset(&self) {
        self.transport.reset();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Number of logical connections established so far.
    pub fn generation(&self) -> u64 {
        self.transport.generation()
    }

    /// Calls awaiting a result, including queued ones.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Calls waiting for a connection before being sent.
    pub fn queued_count(&self) -> usize {
        self.outbox.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Periodically times out stale calls. Requires a configured timeout and
/// an ambient tokio runtime.
fn spawn_sweeper(dispatcher: &Arc<Dispatcher>, config: &TransportConfig) -> Option<JoinHandle<()>> {
    let timeout = config.request_timeout()?;
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("no async runtime; request timeouts only apply to call_async");
        return None;
    };

    let dispatcher = Arc::downgrade(dispatcher);
    let period = config.sweep_interval();
    Some(handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(dispatcher) = dispatcher.upgrade() else {
                break;
            };
            let expired = dispatcher.expire(timeout);
            if expired > 0 {
                tracing::debug!("expired {} calls", expired);
            }
        }
    }))
}
