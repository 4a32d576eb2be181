//! Transport for channels that can drop, with automatic reconnect.

use crate::channel::{ChannelError, ChannelObserver, MetaEvent, NativeChannel, WeakObserver};
use crate::config::ReconnectConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::transport::{ConnectCallback, ConnectionHooks, ConnectionState, Link, Transport};
use bridgerpc_protocol::Message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Outcome of a single `start` attempt.
enum Attempt {
    Connected,
    Failed(ChannelError),
    /// The transport was closed while the attempt was in flight.
    Aborted,
}

/// Transport over a channel that may disconnect.
///
/// State machine: `Disconnected -> Connecting -> Connected`, back to
/// `Disconnected` on channel loss, and `Closed` (terminal) from any state.
/// Reconnects are scheduled on the ambient tokio runtime using the
/// configured backoff.
pub struct ReconnectingTransport {
    this: Weak<ReconnectingTransport>,
    link: Link,
    hooks: ConnectionHooks,
    policy: ReconnectConfig,
    state: Mutex<ConnectionState>,
    /// Connect callbacks waiting on the in-flight attempt.
    waiters: Mutex<Vec<ConnectCallback>>,
    /// Consecutive failed attempts since the last successful connect.
    failures: AtomicU32,
    generation: AtomicU64,
    retry_scheduled: AtomicBool,
}

impl ReconnectingTransport {
    /// Creates a disconnected transport subscribed to `channel`.
    pub fn new(
        channel: Arc<dyn NativeChannel>,
        dispatcher: Arc<Dispatcher>,
        hooks: ConnectionHooks,
        policy: ReconnectConfig,
        max_payload: u64,
    ) -> Arc<Self> {
        let transport = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            link: Link::new(channel, dispatcher, max_payload),
            hooks,
            policy,
            state: Mutex::new(ConnectionState::Disconnected),
            waiters: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            retry_scheduled: AtomicBool::new(false),
        });
        transport
            .link
            .channel
            .subscribe(Arc::new(WeakObserver(Arc::downgrade(&transport))));
        transport
    }

    /// Runs one `start` attempt and settles every waiting connect callback.
    fn attempt(&self) {
        let result = self.link.channel.start();

        let (outcome, waiters) = {
            let mut state = self.state.lock();
            let outcome = match (*state, result) {
                (ConnectionState::Closed, _) => Attempt::Aborted,
                (_, Ok(())) => {
                    *state = ConnectionState::Connected;
                    Attempt::Connected
                }
                (_, Err(e)) => {
                    *state = ConnectionState::Disconnected;
                    Attempt::Failed(e)
                }
            };
            (outcome, std::mem::take(&mut *self.waiters.lock()))
        };

        let result = match outcome {
            Attempt::Connected => {
                self.failures.store(0, Ordering::SeqCst);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(generation, "connected");
                self.hooks.fire_connect();
                Ok(())
            }
            Attempt::Failed(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(failures, "connect failed: {}", e);
                self.schedule_reconnect();
                Err(e.into())
            }
            Attempt::Aborted => {
                tracing::debug!("connect aborted by close");
                self.link.channel.reset();
                Err(ClientError::Closed)
            }
        };

        for waiter in waiters {
            waiter(result.clone());
        }
    }

    /// Tears down a live connection. No-op unless currently connected.
    fn on_channel_lost(&self, error: ClientError, reset_channel: bool) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        tracing::warn!("connection lost: {}", error);
        self.link.clear();
        if reset_channel {
            self.link.channel.reset();
        }
        self.hooks.fire_disconnect();
        self.link.dispatcher.cancel_all(error);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let failures = self.failures.load(Ordering::SeqCst);
        if !self.policy.allows_attempt(failures) {
            tracing::warn!(failures, "not reconnecting: retries disabled or exhausted");
            return;
        }
        if self.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.retry_scheduled.store(false, Ordering::SeqCst);
                tracing::warn!("no async runtime available; reconnect skipped");
                return;
            }
        };

        let delay = self.policy.delay_for(failures);
        tracing::debug!(?delay, failures, "scheduling reconnect");

        let this = self.this.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(transport) = this.upgrade() else {
                return;
            };
            transport.retry_scheduled.store(false, Ordering::SeqCst);
            if transport.state() == ConnectionState::Closed {
                return;
            }
            transport.connect(Box::new(|result| {
                if let Err(e) = result {
                    tracing::debug!("reconnect attempt failed: {}", e);
                }
            }));
        });
    }

    /// Number of consecutive failed connect attempts.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Transport for ReconnectingTransport {
    fn try_send(&self, message: &Message) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        match self.link.write(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("write failed: {}", e);
                // The failed call reports the send error; everything else
                // in flight is lost with the connection.
                if let Message::Call { id, .. } = message {
                    self.link.dispatcher.cancel(*id, ClientError::NotConnected);
                }
                self.on_channel_lost(ClientError::ConnectionLost, false);
                Err(ClientError::NotConnected)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn connect(&self, callback: ConnectCallback) {
        let mut state = self.state.lock();
        let current = *state;
        match current {
            ConnectionState::Connected => {
                drop(state);
                callback(Ok(()));
            }
            ConnectionState::Closed => {
                drop(state);
                callback(Err(ClientError::Closed));
            }
            ConnectionState::Connecting => {
                self.waiters.lock().push(callback);
            }
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                self.waiters.lock().push(callback);
                drop(state);
                tracing::debug!("connecting");
                self.attempt();
            }
        }
    }

    fn close(&self) {
        let (previous, waiters) = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = ConnectionState::Closed;
            (previous, std::mem::take(&mut *self.waiters.lock()))
        };
        if previous == ConnectionState::Closed {
            return;
        }

        tracing::info!(from = %previous, "closing transport");
        self.link.clear();
        if previous == ConnectionState::Connected {
            self.hooks.fire_disconnect();
        }
        self.link.dispatcher.cancel_all(ClientError::Closed);
        self.link.channel.reset();

        for waiter in waiters {
            waiter(Err(ClientError::Closed));
        }
    }

    fn reset(&self) {
        tracing::debug!("requesting channel reset");
        self.link.channel.reset();
        self.on_channel_lost(ClientError::ConnectionLost, false);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.link.dispatcher
    }
}

impl ChannelObserver for ReconnectingTransport {
    fn on_data(&self, data: &[u8]) {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            state => {
                tracing::debug!(%state, len = data.len(), "dropping inbound bytes");
                return;
            }
        }

        if let Err(e) = self.link.ingest(data) {
            tracing::warn!("protocol error: {}", e);
            self.link.clear();
            self.on_channel_lost(e.into(), true);
        }
    }

    fn on_meta_event(&self, event: MetaEvent) {
        match event {
            MetaEvent::EngineReset | MetaEvent::ChannelClosed => {
                self.on_channel_lost(ClientError::ConnectionLost, false);
            }
            MetaEvent::Other(name) => {
                tracing::debug!(event = %name, "unhandled meta event");
            }
        }
    }
}
