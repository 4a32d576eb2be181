//! Always-connected transport over an in-process bridge.

use crate::channel::{ChannelError, ChannelObserver, MetaEvent, NativeChannel, WeakObserver};
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::transport::{ConnectCallback, ConnectionHooks, ConnectionState, Link, Transport};
use bridgerpc_protocol::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transport for a bridge that is live for the whole process lifetime.
///
/// The state never leaves `Connected`. An engine reset is surfaced as a
/// logical reconnect: pending calls fail and the connect hook fires again.
pub struct BridgeTransport {
    link: Link,
    hooks: ConnectionHooks,
    generation: AtomicU64,
}

impl BridgeTransport {
    /// Creates the transport and subscribes it to `channel`.
    ///
    /// The channel is not started; call [`BridgeTransport::start`].
    pub fn new(
        channel: Arc<dyn NativeChannel>,
        dispatcher: Arc<Dispatcher>,
        hooks: ConnectionHooks,
        max_payload: u64,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            link: Link::new(channel, dispatcher, max_payload),
            hooks,
            generation: AtomicU64::new(1),
        });
        transport
            .link
            .channel
            .subscribe(Arc::new(WeakObserver(Arc::downgrade(&transport))));
        transport
    }

    /// Starts the native channel.
    pub fn start(&self) -> Result<(), ChannelError> {
        self.link.channel.start()?;
        tracing::debug!("bridge channel started");
        Ok(())
    }

    fn on_engine_reset(&self) {
        self.link.clear();
        let failed = self.link.dispatcher.cancel_all(ClientError::ConnectionLost);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, failed, "engine reset");
        self.hooks.fire_connect();
    }
}

impl Transport for BridgeTransport {
    fn try_send(&self, message: &Message) -> Result<(), ClientError> {
        self.link.write(message)
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn connect(&self, callback: ConnectCallback) {
        callback(Ok(()));
    }

    fn close(&self) {
        tracing::debug!("close ignored: bridge transport stays connected");
    }

    fn reset(&self) {
        tracing::debug!("requesting bridge reset");
        self.link.channel.reset();
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.link.dispatcher
    }
}

impl ChannelObserver for BridgeTransport {
    fn on_data(&self, data: &[u8]) {
        if let Err(e) = self.link.ingest(data) {
            tracing::warn!("protocol error on bridge, resetting: {}", e);
            self.link.clear();
            self.link.dispatcher.cancel_all(e.into());
            self.link.channel.reset();
        }
    }

    fn on_meta_event(&self, event: MetaEvent) {
        match event {
            MetaEvent::EngineReset => self.on_engine_reset(),
            MetaEvent::ChannelClosed => {
                tracing::warn!("bridge reported channel-closed; ignoring");
            }
            MetaEvent::Other(name) => {
                tracing::debug!(event = %name, "unhandled meta event");
            }
        }
    }
}
