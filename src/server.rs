//! TCP server that accepts connections as [`Channel`]s.
//!
//! Binds a listening socket, runs the accept loop as a tokio task and keeps a
//! registry of connected channels keyed by peer address. Each accepted
//! connection is announced through [`ServerEvent::Connect`].
//!
//! # Lifecycle
//!
//! ```text
//! bind() ──► Bound ──start()──► Listening ──close()──► Closed
//!   │                                          ▲
//!   └──────────────────close()─────────────────┘
//! ```
//!
//! While paused the accept loop keeps draining the OS backlog but closes
//! every accepted socket immediately, so pending connections never pile up.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelEvent};
use crate::events::{ListenerId, Listeners};

/// Default listen backlog.
pub const DEFAULT_MAX_PENDING: u32 = 8;

/// Delay before retrying after an accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Event emitted by a [`TcpServer`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and is ready.
    Connect(Channel),
    /// The server closed.
    Close {
        /// Address the server was bound to.
        host: SocketAddr,
    },
}

/// Operations shared by [`TcpServer`] and the wrappers that stand in for it.
pub trait Server: Send + Sync {
    /// Start listening with a backlog of `max_pending`.
    fn start(&self, max_pending: u32) -> Result<()>;

    /// Reject new connections until [`Server::resume`].
    fn pause(&self);

    /// Accept new connections again.
    fn resume(&self);

    /// Close the server and every connected channel. Always returns `true`.
    fn close(&self) -> bool;

    /// Returns true once the listening socket is gone.
    fn is_closed(&self) -> bool;

    /// Returns true while paused.
    fn is_paused(&self) -> bool;

    /// Bound address.
    fn host(&self) -> SocketAddr;

    /// Snapshot of the connected physical channels.
    fn channels(&self) -> Vec<Channel>;
}

/// Listening socket state.
enum ListenerState {
    /// Bound, not yet listening.
    Bound(TcpSocket),
    /// Accept loop running; cancelling the token stops it and drops the
    /// listener.
    Listening(CancellationToken),
    Closed,
}

/// TCP server producing [`Channel`]s.
///
/// Cheap to clone; all clones share the same listener and registry.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    host: SocketAddr,
    message_mode: bool,
    paused: AtomicBool,
    /// Lock order: `listener` before `channels`.
    listener: Mutex<ListenerState>,
    channels: Mutex<HashMap<SocketAddr, Channel>>,
    listeners: Listeners<ServerEvent>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Ok(ListenerState::Listening(shutdown)) = self.listener.get_mut() {
            shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("host", &self.inner.host)
            .field("message_mode", &self.inner.message_mode)
            .field("paused", &self.is_paused())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Bind a server to `addr` without listening yet.
    ///
    /// Port `0` binds an ephemeral port; [`TcpServer::host`] reports the
    /// port actually chosen.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve or cannot be bound.
    pub fn bind<A: ToSocketAddrs>(addr: A, message_mode: bool) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .context("Failed to resolve server address")?
            .next()
            .context("Server address resolved to nothing")?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create server socket")?;
        #[cfg(unix)]
        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind server: {addr}"))?;
        let host = socket
            .local_addr()
            .context("Failed to read bound address")?;

        log::info!("[Server] Bound to {host}");

        Ok(Self {
            inner: Arc::new(ServerInner {
                host,
                message_mode,
                paused: AtomicBool::new(false),
                listener: Mutex::new(ListenerState::Bound(socket)),
                channels: Mutex::new(HashMap::new()),
                listeners: Listeners::new(),
            }),
        })
    }

    /// Start listening and spawn the accept loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_pending` is zero, the server is already
    /// listening or closed, or `listen` fails.
    pub fn start(&self, max_pending: u32) -> Result<()> {
        if max_pending == 0 {
            bail!("max_pending must be positive");
        }

        let mut state = self.inner.listener.lock().expect("server listener mutex poisoned");
        let socket = match std::mem::replace(&mut *state, ListenerState::Closed) {
            ListenerState::Bound(socket) => socket,
            other => {
                let started = matches!(other, ListenerState::Listening(_));
                *state = other;
                if started {
                    bail!("Server {} is already listening", self.inner.host);
                }
                bail!("Server {} is closed", self.inner.host);
            }
        };

        let listener = socket
            .listen(max_pending)
            .with_context(|| format!("Failed to listen on {}", self.inner.host))?;
        let shutdown = CancellationToken::new();
        *state = ListenerState::Listening(shutdown.clone());
        drop(state);

        log::info!(
            "[Server] Listening on {} (backlog {max_pending})",
            self.inner.host
        );
        tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener, shutdown));
        Ok(())
    }

    /// Reject new connections until [`TcpServer::resume`].
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        log::info!("[Server] {} paused", self.inner.host);
    }

    /// Accept new connections again.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        log::info!("[Server] {} resumed", self.inner.host);
    }

    /// Close every channel, stop the accept loop and drop the listener.
    ///
    /// Closing an already-closed server logs a warning and returns `true`
    /// without emitting another [`ServerEvent::Close`].
    pub fn close(&self) -> bool {
        let previous = {
            let mut state = self.inner.listener.lock().expect("server listener mutex poisoned");
            std::mem::replace(&mut *state, ListenerState::Closed)
        };

        match previous {
            ListenerState::Closed => {
                log::warn!("[Server] {} is already closed", self.inner.host);
                return true;
            }
            ListenerState::Listening(shutdown) => shutdown.cancel(),
            ListenerState::Bound(socket) => drop(socket),
        }

        let channels: Vec<Channel> = self
            .inner
            .channels
            .lock()
            .expect("server channels mutex poisoned")
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &channels {
            channel.close();
        }

        log::info!(
            "[Server] {} closed ({} channel(s) dropped)",
            self.inner.host,
            channels.len()
        );
        self.inner.listeners.emit(&ServerEvent::Close {
            host: self.inner.host,
        });
        true
    }

    /// Returns true once the listening socket is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            *self.inner.listener.lock().expect("server listener mutex poisoned"),
            ListenerState::Closed
        )
    }

    /// Returns true while paused.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether accepted channels run in message mode.
    pub fn is_message_mode(&self) -> bool {
        self.inner.message_mode
    }

    /// Bound address.
    pub fn host(&self) -> SocketAddr {
        self.inner.host
    }

    /// Snapshot of the connected channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .channels
            .lock()
            .expect("server channels mutex poisoned")
            .values()
            .filter(|channel| !channel.is_closed())
            .cloned()
            .collect()
    }

    /// Register a listener for every server event.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(callback)
    }

    /// Remove a listener.
    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Receive server events through an unbounded channel.
    pub fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        self.inner.listeners.subscribe()
    }
}

impl Server for TcpServer {
    fn start(&self, max_pending: u32) -> Result<()> {
        TcpServer::start(self, max_pending)
    }

    fn pause(&self) {
        TcpServer::pause(self);
    }

    fn resume(&self) {
        TcpServer::resume(self);
    }

    fn close(&self) -> bool {
        TcpServer::close(self)
    }

    fn is_closed(&self) -> bool {
        TcpServer::is_closed(self)
    }

    fn is_paused(&self) -> bool {
        TcpServer::is_paused(self)
    }

    fn host(&self) -> SocketAddr {
        TcpServer::host(self)
    }

    fn channels(&self) -> Vec<Channel> {
        TcpServer::channels(self)
    }
}

impl ServerInner {
    /// Handle one accepted connection.
    fn accept_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.paused.load(Ordering::SeqCst) {
            log::debug!("[Server] Paused, rejecting {peer}");
            drop(stream);
            return;
        }
        self.add_accepted_channel(stream, peer);
    }

    /// Register an accepted stream as a channel and announce it.
    fn add_accepted_channel(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let channel = {
            let state = self.listener.lock().expect("server listener mutex poisoned");
            if matches!(*state, ListenerState::Closed) {
                log::debug!("[Server] Closed, discarding {peer}");
                return;
            }

            let channel = Channel::from_stream(stream, peer, self.message_mode);
            let server = Arc::downgrade(self);
            let closing = channel.clone();
            channel.on_event(move |event| {
                if *event == ChannelEvent::Close {
                    if let Some(server) = server.upgrade() {
                        server.close_channel(&closing);
                    }
                }
            });

            self.channels
                .lock()
                .expect("server channels mutex poisoned")
                .insert(peer, channel.clone());
            channel
        };

        channel.mark_connected();
        log::info!("[Server] Client connected: {peer}");
        self.listeners.emit(&ServerEvent::Connect(channel.clone()));
        channel.start_reading();
    }

    /// Drop a closed channel from the registry.
    fn close_channel(&self, channel: &Channel) {
        let mut channels = self.channels.lock().expect("server channels mutex poisoned");
        let peer = channel.peer_addr();
        if channels.get(&peer).is_some_and(|known| known.ptr_eq(channel)) {
            channels.remove(&peer);
            log::info!("[Server] Client disconnected: {peer}");
        }
    }
}

/// Accept loop — runs as a tokio task until cancelled or the server is gone.
async fn accept_loop(server: Weak<ServerInner>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let Some(server) = server.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => server.accept_connection(stream, peer),
            Err(e) => {
                log::error!("[Server] Accept error on {}: {e}", server.host);
                drop(server);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    log::debug!("[Server] Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{encode_message, MessageDecoder};
    use crate::testing::{capture_logs, CapturedLogs};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(2);

    fn start_server() -> TcpServer {
        let server = TcpServer::bind("127.0.0.1:0", true).unwrap();
        server.start(DEFAULT_MAX_PENDING).unwrap();
        server
    }

    async fn next_event(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for server event")
            .expect("Event channel closed")
    }

    #[tokio::test]
    async fn test_server_accepts_connection_and_fires_event() {
        let server = start_server();
        let mut rx = server.subscribe();

        let client = TcpStream::connect(server.host()).await.unwrap();

        match next_event(&mut rx).await {
            ServerEvent::Connect(channel) => {
                assert_eq!(channel.peer_addr(), client.local_addr().unwrap());
                assert_eq!(channel.state(), crate::channel::ConnectionState::Connected);
                assert_eq!(server.channels().len(), 1);
            }
            other => panic!("Expected Connect, got: {other:?}"),
        }

        server.close();
    }

    #[tokio::test]
    async fn test_ephemeral_port_resolved() {
        let server = TcpServer::bind("127.0.0.1:0", true).unwrap();
        assert_ne!(server.host().port(), 0);
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        assert!(TcpServer::bind(addr, true).and_then(|s| s.start(1)).is_err());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let server = start_server();
        let err = server.start(DEFAULT_MAX_PENDING).unwrap_err().to_string();
        assert!(err.contains("already listening"), "unexpected error: {err}");
        server.close();
    }

    #[tokio::test]
    async fn test_zero_backlog_rejected() {
        let server = TcpServer::bind("127.0.0.1:0", true).unwrap();
        assert!(server.start(0).is_err());
    }

    #[tokio::test]
    async fn test_channel_read_reaches_listener() {
        let server = start_server();
        let mut rx = server.subscribe();
        let mut client = TcpStream::connect(server.host()).await.unwrap();

        let channel = match next_event(&mut rx).await {
            ServerEvent::Connect(channel) => channel,
            other => panic!("Expected Connect, got: {other:?}"),
        };
        let mut channel_rx = channel.subscribe();

        client.write_all(&encode_message(b"ping").unwrap()).await.unwrap();

        let event = tokio::time::timeout(WAIT, channel_rx.recv())
            .await
            .expect("Timed out")
            .expect("Channel closed");
        assert_eq!(event, ChannelEvent::Read(Bytes::from_static(b"ping")));

        channel.send(b"pong").unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("Timed out")
            .expect("Read failed");
        let messages = MessageDecoder::new().feed(&buf[..n]).unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"pong")]);
    }

    #[tokio::test]
    async fn test_client_disconnect_removes_channel() {
        let server = start_server();
        let mut rx = server.subscribe();
        let client = TcpStream::connect(server.host()).await.unwrap();

        let channel = match next_event(&mut rx).await {
            ServerEvent::Connect(channel) => channel,
            other => panic!("Expected Connect, got: {other:?}"),
        };
        let mut channel_rx = channel.subscribe();

        drop(client);

        loop {
            let event = tokio::time::timeout(WAIT, channel_rx.recv())
                .await
                .expect("Timed out")
                .expect("Channel closed");
            if event == ChannelEvent::Close {
                break;
            }
        }
        assert!(server.channels().is_empty());
    }

    #[tokio::test]
    async fn test_paused_server_rejects_cleanly() {
        let server = start_server();
        let mut rx = server.subscribe();
        server.pause();
        assert!(server.is_paused());

        let mut client = TcpStream::connect(server.host()).await.unwrap();

        // Accepted at the OS level, then closed by the server.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("Timed out waiting for rejection")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err(), "No Connect expected while paused");
        assert!(server.channels().is_empty());

        server.resume();
        let _client = TcpStream::connect(server.host()).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Connect(_)));
    }

    #[tokio::test]
    async fn test_close_closes_channels_and_emits_once() {
        let server = start_server();
        let mut rx = server.subscribe();
        let mut client = TcpStream::connect(server.host()).await.unwrap();

        let channel = match next_event(&mut rx).await {
            ServerEvent::Connect(channel) => channel,
            other => panic!("Expected Connect, got: {other:?}"),
        };

        assert!(server.close());
        assert!(server.is_closed());
        assert!(channel.is_closed());
        assert!(server.channels().is_empty());
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Close { .. }));

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("Timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_double_close_is_safe() {
        let logs: CapturedLogs = capture_logs();
        let server = start_server();
        let mut rx = server.subscribe();

        assert!(server.close());
        assert!(matches!(next_event(&mut rx).await, ServerEvent::Close { .. }));
        let warnings_before = logs.warnings();

        assert!(server.close());
        assert_eq!(logs.warnings() - warnings_before, 1);
        assert!(rx.try_recv().is_err(), "Second close must not emit");
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let server = TcpServer::bind("127.0.0.1:0", true).unwrap();
        assert!(server.close());
        assert!(server.is_closed());
        assert!(server.start(DEFAULT_MAX_PENDING).is_err());
    }
}
