//! TLS plumbing for interception
//!
//! - `authority`: local root CA and per-host leaf certificates
//! - `client`: rustls client configuration for upstream dials

pub mod authority;
pub mod client;

use std::sync::Arc;

use tokio_rustls::rustls::crypto::CryptoProvider;

pub use authority::{CertAuthority, LeafCert};
pub use client::upstream_client_config;

/// The crypto provider used by every rustls config in the crate
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(tokio_rustls::rustls::crypto::ring::default_provider())
}
