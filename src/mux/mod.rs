//! Sub-channel multiplexing over one physical channel.
//!
//! # Architecture
//!
//! ```text
//! TcpServer ──Connect(Channel)──► MultiplexedServer ──Connect(MultiplexedChannel)──► app
//!                                                                  │
//!                                              get_subchannel(id)  │  Read(frame)
//!                                                                  ▼
//!                                                   ┌──────────────────────────┐
//!                                                   │ MultiplexedChannel       │
//!                                                   │  id ─► SubChannel        │
//!                                                   │  id ─► SubChannel        │
//!                                                   └──────────────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Each message on the physical channel is `[u8 L][id: L bytes][body]`.
//! An empty body closes the addressed sub-channel. See [`protocol`].
//!
//! Multiplexing only works over message-mode channels: the demultiplexer
//! relies on every read event carrying exactly one frame.

pub mod channel;
pub mod protocol;
pub mod server;
pub mod subchannel;

pub use channel::{MultiplexedChannel, MuxEvent};
pub use protocol::{MuxFrame, MAX_ID_LEN};
pub use server::{MultiplexedServer, MuxServerEvent};
pub use subchannel::{SubChannel, SubChannelEvent};
