//! Control-plane client
//!
//! Layers, from the wire up:
//! - [`transport`]: one HTTP exchange against a base URL
//! - [`hosts`]: active host selection by liveness check
//! - [`breaker`]: consecutive-failure circuit breaker
//! - [`retry`]: linear-backoff retries under a per-call deadline
//! - [`control`]: typed operations carrying the client identity

pub mod api;
pub mod breaker;
pub mod control;
pub mod hosts;
pub mod retry;
pub mod transport;

pub use api::{ApiRequest, ApiResponse};
pub use breaker::{BreakerState, CircuitBreaker};
pub use control::{
    AccountInfo, ClientIdentity, ControlClient, ExclusiveStatus, License, MetricsSnapshot,
    PaymentOrder, Signer, StaticSigner,
};
pub use hosts::HostSelector;
pub use retry::{RetryPolicy, RetryingClient};
pub use transport::{HyperTransport, Transport};
