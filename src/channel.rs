//! Physical TCP channel.
//!
//! A [`Channel`] wraps one connected `TcpStream` and owns two tasks on the
//! tokio reactor:
//!
//! - Read task: reads from the socket and emits [`ChannelEvent::Read`]. In
//!   message mode every read event carries exactly one decoded message (see
//!   [`framing`](crate::framing)); in stream mode it carries whatever one
//!   socket read returned.
//! - Write task: drains queued outbound bytes into the socket, then shuts
//!   down the write half once the channel is closed.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Closing ──► Closed
//!                  (stream wrapped)  (reader armed)   close() / EOF / error
//! ```
//!
//! A channel is closed exactly once; `Close` is the last event it emits.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::events::{ListenerId, Listeners};
use crate::framing::{encode_message, MessageDecoder};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection state of a physical channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket attached.
    #[default]
    Disconnected,
    /// Socket attached, not yet announced as connected.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Close in progress.
    Closing,
    /// Closed; terminal.
    Closed,
}

/// Event emitted by a physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One message (message mode) or one chunk (stream mode) arrived.
    Read(Bytes),
    /// Low-level socket or decode error. Always followed by `Close`.
    Error(String),
    /// The channel closed.
    Close,
}

/// Operations shared by [`Channel`] and the wrappers that stand in for it.
///
/// [`MultiplexedChannel`](crate::mux::MultiplexedChannel) implements this by
/// forwarding to its physical channel, so code that only needs a byte
/// endpoint can accept either.
pub trait Connection: Send + Sync {
    /// Remote address of the underlying socket.
    fn peer_addr(&self) -> SocketAddr;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Whether message boundaries are preserved.
    fn is_message_mode(&self) -> bool;

    /// Returns true once the channel has closed.
    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Queue bytes for sending.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the channel. Returns `false` if it was already closing.
    fn close(&self) -> bool;
}

/// One physical, bidirectional TCP endpoint.
///
/// Cheap to clone; all clones share the same socket and state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    peer: SocketAddr,
    message_mode: bool,
    state: Mutex<ConnectionState>,
    /// Sender for the write task. `None` once closed.
    outbound: Mutex<Option<UnboundedSender<Bytes>>>,
    /// Read half waiting for [`Channel::start_reading`].
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Stops the read task.
    shutdown: CancellationToken,
    listeners: Listeners<ChannelEvent>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .field("message_mode", &self.inner.message_mode)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wrap a connected stream. Spawns the write task; the read task is
    /// armed separately by [`Channel::start_reading`].
    pub(crate) fn from_stream(stream: TcpStream, peer: SocketAddr, message_mode: bool) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Channel] Could not set TCP_NODELAY for {peer}: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();

        tokio::spawn(write_loop(peer, write_half, outbound_rx));

        Self {
            inner: Arc::new(ChannelInner {
                peer,
                message_mode,
                state: Mutex::new(ConnectionState::Connecting),
                outbound: Mutex::new(Some(outbound_tx)),
                reader: Mutex::new(Some(read_half)),
                shutdown: CancellationToken::new(),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Open a client connection to `addr`.
    ///
    /// The returned channel is `Connected` and already reading, so attach
    /// listeners (or a multiplexer) before the peer is expected to send.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect<A: ToSocketAddrs>(addr: A, message_mode: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect channel")?;
        let peer = stream
            .peer_addr()
            .context("Failed to read peer address")?;

        let channel = Self::from_stream(stream, peer, message_mode);
        channel.mark_connected();
        channel.start_reading();
        log::info!("[Channel] Connected to {peer}");
        Ok(channel)
    }

    /// Transition `Connecting` → `Connected`.
    pub(crate) fn mark_connected(&self) {
        let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
        }
    }

    /// Arm the read task. No-op if already armed or closed.
    pub(crate) fn start_reading(&self) {
        let reader = self
            .inner
            .reader
            .lock()
            .expect("channel reader mutex poisoned")
            .take();
        if let Some(reader) = reader {
            tokio::spawn(read_loop(self.clone(), reader));
        }
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("channel state mutex poisoned")
    }

    /// Whether reads deliver whole messages.
    pub fn is_message_mode(&self) -> bool {
        self.inner.message_mode
    }

    /// Returns true once the channel has closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Returns true if both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a listener for every channel event.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(callback)
    }

    /// Register a listener removed after its first event.
    pub fn once_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.once(callback)
    }

    /// Remove a listener.
    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Receive channel events through an unbounded channel.
    pub fn subscribe(&self) -> UnboundedReceiver<ChannelEvent> {
        self.inner.listeners.subscribe()
    }

    /// Queue `data` for the write task.
    ///
    /// In message mode the bytes are sent as one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not connected or the message is
    /// too large.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            bail!("Channel {} is not connected", self.inner.peer);
        }
        let bytes = if self.inner.message_mode {
            encode_message(data)?
        } else {
            Bytes::copy_from_slice(data)
        };

        let outbound = self.inner.outbound.lock().expect("channel outbound mutex poisoned");
        outbound
            .as_ref()
            .ok_or_else(|| anyhow!("Channel {} is closed", self.inner.peer))?
            .send(bytes)
            .map_err(|e| anyhow!("Channel {} write task stopped: {e}", self.inner.peer))
    }

    /// Close the channel.
    ///
    /// Stops the read task, lets the write task flush what is already
    /// queued, emits [`ChannelEvent::Close`] and drops all listeners.
    /// Returns `false` if the channel was already closing or closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.inner.state.lock().expect("channel state mutex poisoned");
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        self.inner.shutdown.cancel();
        self.inner
            .reader
            .lock()
            .expect("channel reader mutex poisoned")
            .take();
        self.inner
            .outbound
            .lock()
            .expect("channel outbound mutex poisoned")
            .take();

        *self.inner.state.lock().expect("channel state mutex poisoned") = ConnectionState::Closed;
        log::debug!("[Channel] {} closed", self.inner.peer);

        self.inner.listeners.emit(&ChannelEvent::Close);
        self.inner.listeners.clear();
        true
    }

    /// Report an error, then close.
    fn fail(&self, reason: String) {
        self.inner.listeners.emit(&ChannelEvent::Error(reason));
        self.close();
    }

    fn dispatch_read(&self, data: Bytes) {
        self.inner.listeners.emit(&ChannelEvent::Read(data));
    }
}

impl Connection for Channel {
    fn peer_addr(&self) -> SocketAddr {
        Channel::peer_addr(self)
    }

    fn state(&self) -> ConnectionState {
        Channel::state(self)
    }

    fn is_message_mode(&self) -> bool {
        Channel::is_message_mode(self)
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        Channel::send(self, data)
    }

    fn close(&self) -> bool {
        Channel::close(self)
    }
}

/// Read loop — decodes socket bytes and emits read events in wire order.
async fn read_loop(channel: Channel, mut reader: OwnedReadHalf) {
    let peer = channel.peer_addr();
    let shutdown = channel.inner.shutdown.clone();
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let result = tokio::select! {
            () = shutdown.cancelled() => return,
            result = reader.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                log::info!("[Channel] {peer} closed by peer");
                channel.close();
                return;
            }
            Ok(n) if channel.is_message_mode() => match decoder.feed(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        // Cancelled first thing in close(), before the state
                        // reaches Closed.
                        if shutdown.is_cancelled() {
                            return;
                        }
                        channel.dispatch_read(message);
                    }
                }
                Err(e) => {
                    log::error!("[Channel] Message decode error for {peer}: {e}");
                    channel.fail(e.to_string());
                    return;
                }
            },
            Ok(_) if shutdown.is_cancelled() => return,
            Ok(n) => channel.dispatch_read(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                log::error!("[Channel] Read error for {peer}: {e}");
                channel.fail(e.to_string());
                return;
            }
        }
    }
}

/// Write loop — drains queued bytes, then shuts the write half down.
async fn write_loop(peer: SocketAddr, mut writer: OwnedWriteHalf, mut outbound: UnboundedReceiver<Bytes>) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Channel] Write error for {peer}: {e}");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("[Channel] Shutdown of {peer} write half failed: {e}");
    }
}
