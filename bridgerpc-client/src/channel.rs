//! Native channel collaborator interface.
//!
//! A [`NativeChannel`] moves opaque byte chunks between this process and the
//! engine. It knows nothing about frames; chunk boundaries are arbitrary.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Native event name for an engine reset.
pub const META_ENGINE_RESET: &str = "engine-reset";

/// Native event name for an unexpected channel loss.
pub const META_CHANNEL_CLOSED: &str = "channel-closed";

/// Channel-level signal distinct from payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaEvent {
    /// The remote engine restarted; its state (and our pending calls) is gone.
    EngineReset,
    /// The channel dropped.
    ChannelClosed,
    /// Any other native event, passed through by name.
    Other(String),
}

impl MetaEvent {
    /// Maps a native event name.
    pub fn parse(name: &str) -> Self {
        match name {
            META_ENGINE_RESET => MetaEvent::EngineReset,
            META_CHANNEL_CLOSED => MetaEvent::ChannelClosed,
            other => MetaEvent::Other(other.to_string()),
        }
    }
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel not started")]
    NotStarted,

    #[error("channel closed")]
    Closed,

    #[error("channel failure: {0}")]
    Failed(String),
}

/// Receives inbound bytes and meta-events from a channel.
pub trait ChannelObserver: Send + Sync {
    fn on_data(&self, data: &[u8]);

    fn on_meta_event(&self, event: MetaEvent);
}

/// Byte-oriented duplex channel to the engine.
pub trait NativeChannel: Send + Sync {
    /// Starts (or restarts) the channel.
    fn start(&self) -> Result<(), ChannelError>;

    /// Asks the native side to reset the channel and the engine behind it.
    fn reset(&self);

    /// Writes one chunk. A frame is always written in a single call.
    fn write(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Installs the observer that receives inbound data and meta-events.
    fn subscribe(&self, observer: Arc<dyn ChannelObserver>);
}

/// Observer that forwards to `T` while it is alive.
///
/// Lets a transport observe the channel it owns without a reference cycle.
pub(crate) struct WeakObserver<T>(pub(crate) Weak<T>);

impl<T: ChannelObserver> ChannelObserver for WeakObserver<T> {
    fn on_data(&self, data: &[u8]) {
        if let Some(target) = self.0.upgrade() {
            target.on_data(data);
        }
    }

    fn on_meta_event(&self, event: MetaEvent) {
        if let Some(target) = self.0.upgrade() {
            target.on_meta_event(event);
        }
    }
}

/// In-process channel.
///
/// A standalone channel records every write. A channel created with
/// [`MemoryChannel::pair`] also delivers each write to its peer's observer,
/// synchronously, on the writer's thread.
pub struct MemoryChannel {
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
    peer: Mutex<Option<Weak<MemoryChannel>>>,
    written: Mutex<Vec<Bytes>>,
    started: AtomicBool,
    start_failures: AtomicUsize,
    start_count: AtomicUsize,
    reset_count: AtomicUsize,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observer: Mutex::new(None),
            peer: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            start_failures: AtomicUsize::new(0),
            start_count: AtomicUsize::new(0),
            reset_count: AtomicUsize::new(0),
        })
    }

    /// Creates two channels wired back to back.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *a.peer.lock() = Some(Arc::downgrade(&b));
        *b.peer.lock() = Some(Arc::downgrade(&a));
        (a, b)
    }

    /// Makes the next `n` calls to `start` fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    /// Delivers bytes to the observer as if they arrived from the engine.
    pub fn inject(&self, data: &[u8]) {
        if let Some(observer) = self.current_observer() {
            observer.on_data(data);
        }
    }

    /// Delivers a meta-event to the observer.
    pub fn emit_meta(&self, event: MetaEvent) {
        if let Some(observer) = self.current_observer() {
            observer.on_meta_event(event);
        }
    }

    /// Simulates the channel dropping: writes fail until the next `start`.
    pub fn disconnect(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.emit_meta(MetaEvent::ChannelClosed);
    }

    /// Removes and returns everything written so far.
    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.written.lock())
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count.load(Ordering::SeqCst)
    }

    fn current_observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        self.observer.lock().clone()
    }
}

impl NativeChannel for MemoryChannel {
    fn start(&self) -> Result<(), ChannelError> {
        let failed = self
            .start_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ChannelError::Failed("scripted start failure".to_string()));
        }
        self.start_count.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_started() {
            return Err(ChannelError::NotStarted);
        }
        self.written.lock().push(Bytes::copy_from_slice(data));

        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.inject(data);
        }
        Ok(())
    }

    fn subscribe(&self, observer: Arc<dyn ChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }
}
