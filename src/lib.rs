//! Interpose - intercepting HTTP/HTTPS proxy
//!
//! A local man-in-the-middle proxy with a pluggable handler chain, plus a
//! resilient client for the control plane it reports to.
//!
//! ## Features
//!
//! - Plain HTTP forwarding and CONNECT tunnelling
//! - TLS interception with per-host leaf certificates from a local root
//! - Ordered request/response handlers with per-handler error containment
//! - Upstream dialing through HTTP CONNECT or SOCKS5 egress proxies
//! - Supervised restarts with exponential backoff
//! - Control-plane client with circuit breaker, linear-backoff retries and
//!   host failover

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::Config;
pub use context::AppContext;
pub use error::{InterposeError, Result};
