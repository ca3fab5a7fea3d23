//! One logical stream inside a [`MultiplexedChannel`](super::MultiplexedChannel).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use super::channel::MuxInner;
use crate::events::{ListenerId, Listeners};

/// Event emitted by a [`SubChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubChannelEvent {
    /// A message body addressed to this sub-channel arrived.
    Read(Bytes),
    /// The sub-channel closed.
    Close,
}

/// A logical stream addressed by a binary id.
///
/// Owned by its multiplexer; the back-reference to the multiplexer is weak
/// and only used to send frames. Cheap to clone.
#[derive(Clone)]
pub struct SubChannel {
    inner: Arc<SubInner>,
}

struct SubInner {
    id: Bytes,
    parent: Weak<MuxInner>,
    closed: AtomicBool,
    listeners: Listeners<SubChannelEvent>,
}

impl std::fmt::Debug for SubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannel")
            .field("id", &String::from_utf8_lossy(&self.inner.id))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SubChannel {
    pub(crate) fn new(parent: Weak<MuxInner>, id: Bytes) -> Self {
        Self {
            inner: Arc::new(SubInner {
                id,
                parent,
                closed: AtomicBool::new(false),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Raw id bytes.
    pub fn id(&self) -> &[u8] {
        &self.inner.id
    }

    /// Id as UTF-8, if it is valid UTF-8.
    pub fn id_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.inner.id).ok()
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns true if both handles refer to the same sub-channel.
    pub fn ptr_eq(&self, other: &SubChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a listener for every sub-channel event.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SubChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(callback)
    }

    /// Register a listener removed after its first event.
    pub fn once_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SubChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.once(callback)
    }

    /// Remove a listener.
    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Receive sub-channel events through an unbounded channel.
    pub fn subscribe(&self) -> UnboundedReceiver<SubChannelEvent> {
        self.inner.listeners.subscribe()
    }

    /// Send `data` to the peer's sub-channel with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty (an empty body is the close
    /// signal), the sub-channel is closed, or the physical channel is gone.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!("Empty payload is reserved for the close signal");
        }
        if self.is_closed() {
            bail!("Sub-channel {:?} is closed", String::from_utf8_lossy(&self.inner.id));
        }
        self.parent()?.send_frame(&self.inner.id, data)
    }

    /// Close locally and tell the peer.
    ///
    /// The close signal is best effort: if the physical channel is already
    /// gone the sub-channel still closes. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.parent() {
            Ok(parent) => {
                if let Err(e) = parent.send_frame(&self.inner.id, &[]) {
                    log::debug!("[Mux] Close signal for {:?} not sent: {e}", self);
                }
            }
            Err(e) => log::debug!("[Mux] Close signal for {:?} not sent: {e}", self),
        }
        self.finish_close();
        true
    }

    /// Close in response to the peer or the physical channel; sends nothing.
    pub(crate) fn close_remote(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.finish_close();
        true
    }

    /// Hand an inbound body to listeners. Discarded once closed.
    pub(crate) fn deliver(&self, body: Bytes) {
        if self.is_closed() {
            log::debug!("[Mux] Dropping {} byte(s) for closed {:?}", body.len(), self);
            return;
        }
        self.inner.listeners.emit(&SubChannelEvent::Read(body));
    }

    fn finish_close(&self) {
        log::debug!("[Mux] Sub-channel {:?} closed", String::from_utf8_lossy(&self.inner.id));
        self.inner.listeners.emit(&SubChannelEvent::Close);
        self.inner.listeners.clear();
    }

    fn parent(&self) -> Result<Arc<MuxInner>> {
        self.inner
            .parent
            .upgrade()
            .ok_or_else(|| anyhow!("Multiplexed channel is gone"))
    }
}
