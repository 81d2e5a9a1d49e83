//! GridBench transport layer
//!
//! Addressing, wire types and message links shared by the coordinator,
//! agents and workers of a distributed benchmark.
//!
//! # Topology
//!
//! ```text
//!   Coordinator ──dial──> Agent ──dial──> Worker
//!        ^                  |  ^             |
//!        └── upward msgs ───┘  └─ upward ────┘
//! ```
//!
//! Parents dial their children. Every connection is a bidirectional [`Link`]:
//! the dialing side submits commands, the accepting side uses the same link to
//! send failures and statistics back up.
//!
//! The byte stream under a link is pluggable through [`Dialer`] and
//! [`Listener`]. [`TcpDialer`]/[`TcpListener`] are used in production; the
//! simulation harness plugs in in-memory pipes.

mod address;
mod connector;
mod error;
mod link;
mod tcp_impl;
mod types;

pub use address::{AddressLevel, FormatError, SimulatorAddress};
pub use connector::{ClientConnector, Dialer, Listener, ServerConnector, TransportConfig};
pub use error::{ConnectError, TransportError};
pub use link::{
    read_frame, write_frame, AsyncStream, BoxedStream, Link, MessageHandler, Promise,
    ResponseFuture, WireSchema, MAX_FRAME_SIZE,
};
pub use tcp_impl::{TcpDialer, TcpListener};
pub use types::{Frame, Response, ResponsePart, ResponseType, SimulatorMessage};
