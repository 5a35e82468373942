//! Interpose - TLS-intercepting HTTP proxy
//!
//! An HTTP/1.x forward proxy with a plugin pipeline.
//!
//! ## Features
//!
//! - Incremental HTTP/1.x parsing with pipelining and chunked bodies
//! - CONNECT tunnels, optionally terminated with per-host certificates minted
//!   from a local root CA
//! - Plugin hooks before the upstream connection, per request, per chunk, and on close
//! - URL filtering, Basic proxy authentication, and per-client rate limiting
//! - Connection limit with accept backlog queueing

pub mod config;
pub mod error;
pub mod http;
pub mod plugin;
pub mod proxy;
pub mod tls;

pub use config::Config;
pub use error::{ProxyError, Result};
