//! # tglink-client
//!
//! Client-side transport core for a traffic-generator control plane: one
//! long-lived server, two channels, one coherent session.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `config` | Constructor-time knobs (hosts, ports, timeouts, budgets) |
//! | `transport` | Channel seams (`Connector`, transports) + TCP implementation |
//! | `rpc` | Synchronous request/response client: calls, batches, long-poll |
//! | `subscriber` | Background receive loop, event dispatch, barrier protocol |
//! | `monitor` | Duty-cycle observability for the receive loop |
//! | `session` | Shared session state and the subscriber's write capability |
//! | `connection` | Orchestrator: connect handshake, teardown, liveness |
//!
//! ## Data Flow
//!
//! [`connection::Connection::connect`] opens the command channel, performs
//! the version/session handshake, starts the [`subscriber::Subscriber`], and
//! proves end-to-end liveness with one barrier round trip. Afterward callers
//! issue calls through the connection while the subscriber dispatches
//! server-pushed events autonomously.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod monitor;
pub mod rpc;
pub mod session;
pub mod subscriber;
pub mod transport;

pub use config::LinkConfig;
pub use connection::Connection;
pub use rpc::{RpcCall, RpcClient};
pub use session::{ConnState, SessionCore, SessionHandle};
pub use subscriber::Subscriber;
pub use transport::{Connector, RequestTransport, StreamTransport, TcpConnector};

pub use tglink_core::errors::{FrameError, LinkError};
pub use tglink_core::events::{EventEmitter, LinkEvent};
pub use tglink_core::wire::{RpcResult, StreamMessage};
