//! Call correlation and incoming message routing.

use crate::error::ClientError;
use bridgerpc_protocol::{ErrorCode, Message, MessageId, RpcError, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives the outcome of a call, exactly once.
pub type ResultCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send + 'static>;

/// Handles calls and notifications initiated by the remote side.
pub trait IncomingHandler: Send + Sync {
    /// Returns the result for a call. For notifications the result is
    /// dropped and only errors are logged.
    fn handle(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;
}

impl<F> IncomingHandler for F
where
    F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync,
{
    fn handle(&self, _method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self(args)
    }
}

/// Wraps a closure as a shareable [`IncomingHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn IncomingHandler>
where
    F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An issued call awaiting its response.
pub struct PendingCall {
    pub id: MessageId,
    pub method: String,
    pub created_at: Instant,
    callback: ResultCallback,
}

impl PendingCall {
    fn complete(self, result: Result<Value, ClientError>) {
        (self.callback)(result);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Routes decoded messages to pending calls or registered handlers.
///
/// The pending table is the only shared mutable call state. Every insert,
/// remove and drain happens under one lock, and callbacks always run after
/// the lock is released so a callback may issue new calls.
pub struct Dispatcher {
    /// Pending calls keyed by correlation id.
    pending: Mutex<HashMap<MessageId, PendingCall>>,
    /// Handlers for remote-initiated calls and notifications.
    handlers: RwLock<HashMap<String, Arc<dyn IncomingHandler>>>,
    /// Next correlation id.
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh id, stores the pending call and returns the id with
    /// the call envelope ready to send.
    pub fn register_call(
        &self,
        method: &str,
        args: Vec<Value>,
        callback: ResultCallback,
    ) -> (MessageId, Message) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = PendingCall {
            id,
            method: method.to_string(),
            created_at: Instant::now(),
            callback,
        };
        self.pending.lock().insert(id, call);
        tracing::trace!(id, method, "registered pending call");
        (id, Message::call(id, method, args))
    }

    /// Resolves a pending call. Returns false if the id is not pending.
    pub fn resolve(&self, id: MessageId, result: Result<Value, ClientError>) -> bool {
        match self.try_resolve(id, result) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("discarding result: {}", e);
                false
            }
        }
    }

    /// Resolves a pending call, reporting `StalePendingId` for unknown ids.
    pub fn try_resolve(
        &self,
        id: MessageId,
        result: Result<Value, ClientError>,
    ) -> Result<(), ClientError> {
        let call = self
            .pending
            .lock()
            .remove(&id)
            .ok_or(ClientError::StalePendingId(id))?;
        tracing::trace!(id, method = %call.method, ok = result.is_ok(), "resolving call");
        call.complete(result);
        Ok(())
    }

    /// Fails a single pending call with a local error.
    pub fn cancel(&self, id: MessageId, error: ClientError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Fails every pending call with `error`. Returns how many were failed.
    pub fn cancel_all(&self, error: ClientError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        if count > 0 {
            tracing::debug!("cancelling {} pending calls: {}", count, error);
        }
        for call in drained {
            call.complete(Err(error.clone()));
        }
        count
    }

    /// Fails every call older than `max_age` with `Timeout`.
    pub fn expire(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<MessageId> = pending
                .values()
                .filter(|call| now.duration_since(call.created_at) >= max_age)
                .map(|call| call.id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();
        for call in expired {
            tracing::debug!(id = call.id, method = %call.method, "call timed out");
            call.complete(Err(ClientError::Timeout));
        }
        count
    }

    /// Installs a handler for `method`, replacing any previous one.
    pub fn register_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn IncomingHandler>,
    ) -> Option<Arc<dyn IncomingHandler>> {
        let method = method.into();
        let previous = self.handlers.write().insert(method.clone(), handler);
        if previous.is_some() {
            tracing::warn!(method = %method, "replacing existing incoming handler");
        }
        previous
    }

    /// Removes the handler for `method`.
    pub fn unregister_handler(&self, method: &str) -> Option<Arc<dyn IncomingHandler>> {
        self.handlers.write().remove(method)
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.read().contains_key(method)
    }

    /// Routes one inbound message.
    ///
    /// Returns the response to send back when the message is a call.
    pub fn dispatch_incoming(&self, message: Message) -> Option<Message> {
        match message {
            Message::Response { id, result } => {
                self.resolve(id, result.map_err(ClientError::from));
                None
            }
            Message::Call { id, method, args } => {
                let result = match self.handler(&method) {
                    Some(handler) => handler.handle(&method, args),
                    None => {
                        tracing::warn!(id, method = %method, "incoming call for unknown method");
                        Err(RpcError::unknown_method(&method))
                    }
                };
                if let Err(ref err) = result {
                    if err.error_code() != Some(ErrorCode::UnknownMethod) {
                        tracing::debug!(id, method = %method, "handler returned error: {}", err);
                    }
                }
                Some(Message::Response { id, result })
            }
            Message::Notification { method, args } => {
                match self.handler(&method) {
                    Some(handler) => {
                        if let Err(err) = handler.handle(&method, args) {
                            tracing::warn!(method = %method, "notification handler failed: {}", err);
                        }
                    }
                    None => {
                        tracing::debug!(method = %method, "dropping notification for unknown method");
                    }
                }
                None
            }
            Message::Empty => {
                tracing::trace!("ignoring empty message");
                None
            }
        }
    }

    fn handler(&self, method: &str) -> Option<Arc<dyn IncomingHandler>> {
        self.handlers.read().get(method).cloned()
    }

    /// Returns the number of pending calls.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns whether `id` is still pending.
    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.lock().contains_key(&id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
