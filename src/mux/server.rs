//! Server wrapper that hands out [`MultiplexedChannel`]s.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc::UnboundedReceiver;

use super::channel::MultiplexedChannel;
use crate::channel::Channel;
use crate::events::{ListenerId, Listeners};
use crate::server::{Server, ServerEvent, TcpServer};

/// Event emitted by a [`MultiplexedServer`].
#[derive(Debug, Clone)]
pub enum MuxServerEvent {
    /// A connection was accepted and wrapped.
    Connect(MultiplexedChannel),
    /// The underlying server closed.
    Close {
        /// Address the server was bound to.
        host: SocketAddr,
    },
}

/// A [`TcpServer`] whose connections arrive already multiplexed.
///
/// Intercepts [`ServerEvent::Connect`], wraps the channel in a
/// [`MultiplexedChannel`] and re-emits it as [`MuxServerEvent::Connect`].
/// Everything else is delegated to the wrapped server.
#[derive(Clone)]
pub struct MultiplexedServer {
    server: TcpServer,
    listeners: Arc<Listeners<MuxServerEvent>>,
}

impl std::fmt::Debug for MultiplexedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedServer")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl MultiplexedServer {
    /// Bind a message-mode server to `addr` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::new(TcpServer::bind(addr, true)?)
    }

    /// Wrap an existing server.
    ///
    /// Must be called before the server starts accepting, or connections
    /// accepted earlier are announced unwrapped.
    ///
    /// # Errors
    ///
    /// Returns an error if the server runs in stream mode.
    pub fn new(server: TcpServer) -> Result<Self> {
        if !server.is_message_mode() {
            bail!(
                "Multiplexing requires a message-mode server ({} is stream mode)",
                server.host()
            );
        }

        let listeners = Arc::new(Listeners::new());
        let forward = Arc::clone(&listeners);
        server.on_event(move |event| match event {
            ServerEvent::Connect(channel) => wrap_and_announce(&forward, channel),
            ServerEvent::Close { host } => {
                forward.emit(&MuxServerEvent::Close { host: *host });
            }
        });

        Ok(Self { server, listeners })
    }

    /// The wrapped server.
    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    /// Start listening with a backlog of `max_pending`.
    ///
    /// # Errors
    ///
    /// See [`TcpServer::start`].
    pub fn start(&self, max_pending: u32) -> Result<()> {
        self.server.start(max_pending)
    }

    /// Close the server and every connection. Always returns `true`.
    pub fn close(&self) -> bool {
        self.server.close()
    }

    /// Bound address.
    pub fn host(&self) -> SocketAddr {
        self.server.host()
    }

    /// Register a listener for every multiplexed server event.
    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&MuxServerEvent) + Send + Sync + 'static,
    {
        self.listeners.on(callback)
    }

    /// Remove a listener.
    pub fn off_event(&self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    /// Receive multiplexed server events through an unbounded channel.
    pub fn subscribe(&self) -> UnboundedReceiver<MuxServerEvent> {
        self.listeners.subscribe()
    }
}

impl Server for MultiplexedServer {
    fn start(&self, max_pending: u32) -> Result<()> {
        self.server.start(max_pending)
    }

    fn pause(&self) {
        self.server.pause();
    }

    fn resume(&self) {
        self.server.resume();
    }

    fn close(&self) -> bool {
        self.server.close()
    }

    fn is_closed(&self) -> bool {
        self.server.is_closed()
    }

    fn is_paused(&self) -> bool {
        self.server.is_paused()
    }

    fn host(&self) -> SocketAddr {
        self.server.host()
    }

    fn channels(&self) -> Vec<Channel> {
        self.server.channels()
    }
}

fn wrap_and_announce(listeners: &Listeners<MuxServerEvent>, channel: &Channel) {
    match MultiplexedChannel::new(channel.clone()) {
        Ok(mux) => {
            listeners.emit(&MuxServerEvent::Connect(mux));
        }
        Err(e) => {
            log::error!("[Mux] Could not wrap {}: {e}", channel.peer_addr());
            channel.close();
        }
    }
}
