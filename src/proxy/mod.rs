//! Intercepting proxy
//!
//! This module provides the proxy server functionality including:
//! - Plain HTTP forwarding through an ordered handler chain
//! - CONNECT tunnels, with TLS interception via per-host leaf certificates
//! - Upstream dialing, optionally through an egress proxy
//! - A supervisor that restarts the server with exponential backoff

pub mod chain;
pub mod deadline;
pub mod egress;
pub mod flow;
pub mod handler;
pub mod handlers;
pub mod rewind;
pub mod server;
pub mod supervisor;
pub mod tunnel;
pub mod upstream;

pub use chain::{FlowHandler, HandlerChain};
pub use flow::{Flow, FlowResponse, Scheme};
pub use handler::ProxyHandler;
pub use handlers::{HeaderRewriteHandler, PassthroughHandler, RewriteRule, TemplateVars};
pub use server::{ConnectionRegistry, ProxyServer};
pub use supervisor::{ProxySupervisor, SupervisorConfig, SupervisorHandle};
pub use upstream::Upstream;
