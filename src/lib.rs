//! sockmux - many logical sub-channels over one TCP connection.
//!
//! This crate provides a readiness-driven TCP server, a physical channel
//! abstraction with stream and message modes, and a multiplexer that splits
//! one message-mode channel into independently addressed sub-channels.
//!
//! # Architecture
//!
//! - **TcpServer** - accept loop, channel registry, pause/resume
//! - **Channel** - one TCP connection with read/write tasks
//! - **MultiplexedChannel** - routes frames to sub-channels by id
//! - **MultiplexedServer** - hands out connections already multiplexed
//! - **SubChannel** - one logical stream
//!
//! # Modules
//!
//! - [`server`] - TCP server and the [`Server`] trait
//! - [`channel`] - physical channel and the [`Connection`] trait
//! - [`framing`] - message-mode length-prefix codec
//! - [`mux`] - sub-channel protocol, multiplexer and server wrapper
//! - [`events`] - typed listener registry
//! - [`config`] - configuration loading

pub mod channel;
pub mod config;
pub mod events;
pub mod framing;
pub mod mux;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use channel::{Channel, ChannelEvent, Connection, ConnectionState};
pub use config::Config;
pub use mux::{MultiplexedChannel, MultiplexedServer, MuxEvent, MuxServerEvent, SubChannel, SubChannelEvent};
pub use server::{Server, ServerEvent, TcpServer};
