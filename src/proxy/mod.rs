//! Proxy core
//!
//! This module provides:
//! - the accept loop and connection limit
//! - the per-connection state machine
//! - CONNECT tunnels and TLS interception
//! - the bidirectional relay loop

pub mod connection;
pub mod handler;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use connection::{ConnectionId, ConnectionState, ConnectionTracker};
pub use handler::{ConnectionHandler, ProxyContext};
pub use server::ProxyServer;
pub use transport::{prepare_forward_request, Rewind, UpstreamTransport};
pub use tunnel::{ClosePolicy, HttpRelay, RelayEnd, RelayEndReason, RelayMode, RelayOptions, TunnelHandler};
