//! Demultiplexing wrapper around one physical [`Channel`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use super::protocol::{encode_frame, MuxFrame, MAX_ID_LEN};
use super::subchannel::{SubChannel, SubChannelEvent};
use crate::channel::{Channel, ChannelEvent, Connection, ConnectionState};
use crate::events::{ListenerId, Listeners};

/// Event emitted by a [`MultiplexedChannel`].
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// Re-emitted event of the physical channel.
    Channel(ChannelEvent),
    /// The peer opened a sub-channel this side had not seen before.
    Subchannel(SubChannel),
}

/// A physical channel carrying many [`SubChannel`]s.
///
/// Every inbound message is one sub-channel frame (see
/// [`protocol`](super::protocol)). Frames for an unknown id create the
/// sub-channel on the fly and announce it with [`MuxEvent::Subchannel`].
/// Cheap to clone.
#[derive(Clone)]
pub struct MultiplexedChannel {
    inner: Arc<MuxInner>,
}

pub(crate) struct MuxInner {
    channel: Channel,
    /// `None` once the physical channel has closed and every sub-channel
    /// was torn down.
    subchannels: Mutex<Option<HashMap<Bytes, SubChannel>>>,
    listeners: Listeners<MuxEvent>,
}

impl std::fmt::Debug for MultiplexedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedChannel")
            .field("channel", &self.inner.channel)
            .field("subchannels", &self.subchannels().len())
            .finish_non_exhaustive()
    }
}

impl MultiplexedChannel {
    /// Wrap a physical channel.
    ///
    /// The wrapper stays alive as long as the physical channel is open, even
    /// if every handle to it is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is in stream mode or already closed.
    pub fn new(channel: Channel) -> Result<Self> {
        if !channel.is_message_mode() {
            bail!(
                "Multiplexing requires a message-mode channel ({} is stream mode)",
                channel.peer_addr()
            );
        }
        if channel.is_closed() {
            bail!("Channel {} is closed", channel.peer_addr());
        }

        let inner = Arc::new(MuxInner {
            channel: channel.clone(),
            subchannels: Mutex::new(Some(HashMap::new())),
            listeners: Listeners::new(),
        });

        // Strong reference: the physical channel keeps the wrapper alive and
        // drops this listener after it emits Close.
        let handler = Arc::clone(&inner);
        channel.on_event(move |event| {
            match event {
                ChannelEvent::Read(message) => handler.on_message(message),
                ChannelEvent::Close => handler.close_all(),
                ChannelEvent::Error(_) => {}
            }
            handler.listeners.emit(&MuxEvent::Channel(event.clone()));
        });

        Ok(Self { inner })
    }

    /// Sub-channel for a UTF-8 id, created if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is longer than 255 bytes or the physical
    /// channel is closed.
    pub fn get_subchannel(&self, id: &str) -> Result<SubChannel> {
        self.get_subchannel_raw(id.as_bytes())
    }

    /// Sub-channel for a binary id, created if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is longer than 255 bytes or the physical
    /// channel is closed.
    pub fn get_subchannel_raw(&self, id: &[u8]) -> Result<SubChannel> {
        if id.len() > MAX_ID_LEN {
            bail!("Sub-channel id too long: {} bytes (max {MAX_ID_LEN})", id.len());
        }
        if self.inner.channel.is_closed() {
            bail!("Channel {} is closed", self.inner.channel.peer_addr());
        }

        let mut registry = self
            .inner
            .subchannels
            .lock()
            .expect("subchannel registry mutex poisoned");
        let Some(subchannels) = registry.as_mut() else {
            bail!("Channel {} is closed", self.inner.channel.peer_addr());
        };
        if let Some(existing) = subchannels.get(id) {
            return Ok(existing.clone());
        }
        Ok(self
            .inner
            .create_sub(subchannels, Bytes::copy_from_slice(id)))
    }

    /// Snapshot of the open sub-channels.
    pub fn subchannels(&self) -> Vec<SubChannel> {
        self.inner
            .subchannels
            .lock()
            .expect("subchannel registry mutex poisoned")
            .as_ref()
            .map(|subchannels| subchannels.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The wrapped physical channel.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Remote address of the physical channel.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.channel.peer_addr()
    }

    /// Returns true once the physical channel has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Close the physical channel, which closes every sub-channel.
    pub fn close(&self) -> bool {
        self.inner.channel.close()
    }

    /// Register a listener for every multiplexer event.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&MuxEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(callback)
    }

    /// Remove a listener.
    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Receive multiplexer events through an unbounded channel.
    pub fn subscribe(&self) -> UnboundedReceiver<MuxEvent> {
        self.inner.listeners.subscribe()
    }
}

impl Connection for MultiplexedChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.inner.channel.peer_addr()
    }

    fn state(&self) -> ConnectionState {
        self.inner.channel.state()
    }

    fn is_message_mode(&self) -> bool {
        self.inner.channel.is_message_mode()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        self.inner.channel.send(data)
    }

    fn close(&self) -> bool {
        self.inner.channel.close()
    }
}

impl MuxInner {
    /// Route one inbound message to its sub-channel.
    fn on_message(self: &Arc<Self>, message: &Bytes) {
        let frame = match MuxFrame::decode(message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::warn!(
                    "[Mux] Dropping malformed frame from {}: {e}",
                    self.channel.peer_addr()
                );
                return;
            }
        };
        let (sub, created) = {
            let mut registry = self
                .subchannels
                .lock()
                .expect("subchannel registry mutex poisoned");
            let Some(subchannels) = registry.as_mut() else {
                return;
            };
            match subchannels.get(&frame.id) {
                Some(sub) => (sub.clone(), false),
                None if frame.is_close() => return,
                None => (self.create_sub(subchannels, frame.id.clone()), true),
            }
        };

        if frame.is_close() {
            sub.close_remote();
            return;
        }
        if created {
            log::debug!("[Mux] Peer opened {:?} on {}", sub, self.channel.peer_addr());
            self.listeners.emit(&MuxEvent::Subchannel(sub.clone()));
        }
        sub.deliver(frame.body);
    }

    /// Build, register and arm a new sub-channel. Caller holds the registry lock.
    fn create_sub(
        self: &Arc<Self>,
        subchannels: &mut HashMap<Bytes, SubChannel>,
        id: Bytes,
    ) -> SubChannel {
        let sub = SubChannel::new(Arc::downgrade(self), id.clone());

        // Close is the last event a sub-channel emits and its listeners are
        // dropped afterwards, so this runs at most once.
        let parent = Arc::downgrade(self);
        let closing = sub.clone();
        sub.on_event(move |event| {
            if *event == SubChannelEvent::Close {
                if let Some(parent) = parent.upgrade() {
                    parent.close_sub(&closing);
                }
            }
        });

        subchannels.insert(id, sub.clone());
        sub
    }

    /// Drop a closed sub-channel from the registry.
    fn close_sub(&self, sub: &SubChannel) {
        let mut registry = self
            .subchannels
            .lock()
            .expect("subchannel registry mutex poisoned");
        let Some(subchannels) = registry.as_mut() else {
            return;
        };
        if subchannels.get(sub.id()).is_some_and(|known| known.ptr_eq(sub)) {
            subchannels.remove(sub.id());
        }
    }

    /// Close every sub-channel after the physical channel closed.
    ///
    /// The registry is torn down under the lock; afterwards lookups fail and
    /// inbound frames are dropped.
    fn close_all(&self) {
        let torn_down = self
            .subchannels
            .lock()
            .expect("subchannel registry mutex poisoned")
            .take();
        for sub in torn_down.into_iter().flat_map(HashMap::into_values) {
            sub.close_remote();
        }
    }

    pub(crate) fn send_frame(&self, id: &[u8], body: &[u8]) -> Result<()> {
        let frame = encode_frame(id, body)?;
        self.channel.send(&frame)
    }
}
