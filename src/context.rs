//! Explicitly constructed owner of the shared components

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::client::control::numeric_version;
use crate::client::{ClientIdentity, ControlClient, Signer, StaticSigner};
use crate::config::Config;
use crate::error::{InterposeError, Result};
use crate::proxy::{
    HandlerChain, HeaderRewriteHandler, PassthroughHandler, ProxyServer, TemplateVars, Upstream,
};
use crate::tls::{upstream_client_config, CertAuthority};

pub struct AppContext {
    pub config: Config,
    pub bind: SocketAddr,
    /// `None` when TLS interception is disabled
    pub authority: Option<Arc<CertAuthority>>,
    pub chain: Arc<HandlerChain>,
    pub proxy: Arc<ProxyServer>,
    /// `None` when no control hosts are configured
    pub control: Option<Arc<ControlClient>>,
}

impl AppContext {
    pub fn build(config: Config) -> Result<Self> {
        let bind: SocketAddr = config.proxy_addr().parse().map_err(|_| {
            InterposeError::InvalidConfig(format!(
                "PROXY_HOST/PROXY_PORT must form an IP socket address, got {}",
                config.proxy_addr()
            ))
        })?;

        let authority = if config.proxy.intercept_tls {
            let authority = match &config.proxy.ca_dir {
                Some(dir) => CertAuthority::load_or_generate(dir)?,
                None => {
                    info!("No CA directory configured, using an in-memory root");
                    CertAuthority::generate()?
                }
            };
            Some(Arc::new(authority))
        } else {
            warn!("TLS interception disabled, CONNECT tunnels are relayed raw");
            None
        };

        let chain = Arc::new(HandlerChain::new());
        match &config.proxy.rules_file {
            Some(path) => {
                let vars = TemplateVars {
                    device_id: config.identity.device_id.clone(),
                    machine_id: config.identity.machine_id.clone(),
                };
                chain.add_handler(Arc::new(HeaderRewriteHandler::from_file(path, &vars)?));
            }
            None => chain.add_handler(Arc::new(PassthroughHandler)),
        }

        if let Some(egress) = &config.proxy.upstream_proxy {
            info!(proxy = %egress.redacted(), "Upstream traffic routed through proxy");
        }
        let upstream = Upstream::new(
            config.proxy.upstream_proxy.clone(),
            upstream_client_config(config.proxy.verify_upstream_tls)?,
            config.proxy.connect_timeout(),
            config.proxy.io_timeout(),
        );

        let proxy = Arc::new(ProxyServer::new(
            config.proxy.clone(),
            authority.clone(),
            chain.clone(),
            upstream,
        ));

        let control = if config.control.hosts.is_empty() {
            info!("No control hosts configured, control-plane client disabled");
            None
        } else {
            let signer: Arc<dyn Signer> = Arc::new(StaticSigner(config.identity.signature.clone()));
            let identity = ClientIdentity::new(
                &config.identity,
                numeric_version(env!("CARGO_PKG_VERSION")),
                signer.as_ref(),
            );
            Some(Arc::new(ControlClient::from_config(
                &config.control,
                identity,
                signer,
            )?))
        };

        Ok(Self {
            config,
            bind,
            authority,
            chain,
            proxy,
            control,
        })
    }
}
