//! Interpose - Entry Point
//!
//! Starts the supervised proxy and the control-plane client with graceful
//! shutdown support.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use interpose::client::ControlClient;
use interpose::config::LogConfig;
use interpose::proxy::{ProxySupervisor, SupervisorConfig, SupervisorHandle};
use interpose::{AppContext, Config};

#[tokio::main]
async fn main() -> interpose::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Interpose");

    let ctx = AppContext::build(config)?;
    if let Some(authority) = &ctx.authority {
        info!(
            "Install the root certificate from http://{}/ca.pem to inspect HTTPS traffic",
            ctx.bind
        );
        info!(issued = authority.issued_count(), "Certificate authority ready");
    }

    if let Some(control) = ctx.control.clone() {
        tokio::spawn(check_in(control));
    }

    let (handle, shutdown_rx) = SupervisorHandle::new();
    let supervisor = ProxySupervisor::new(
        ctx.proxy.clone(),
        SupervisorConfig::from_proxy_config(ctx.bind, &ctx.config.proxy),
    );
    let supervisor_task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    shutdown_signal().await;
    info!("Shutdown signal received");
    handle.shutdown();

    match supervisor_task.await {
        Ok(Ok(())) => info!("Interpose stopped"),
        Ok(Err(e)) => error!("Proxy shutdown error: {}", e),
        Err(e) => error!("Supervisor task failed: {}", e),
    }

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("interpose={}", log.level).into());
    let json = log.format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Startup calls to the control plane. Failures are logged; the proxy keeps
/// running without it.
async fn check_in(control: Arc<ControlClient>) {
    match control.select_host().await {
        Some(host) => info!(host = %host, "Control plane selected"),
        None => return,
    }

    if let Err(e) = control.health_check().await {
        warn!("Control plane health check failed: {}", e);
        return;
    }

    match control.check_version(env!("CARGO_PKG_VERSION")).await {
        Ok(Some(url)) => info!(url = %url, "A newer version is available"),
        Ok(None) => info!("Running the latest version"),
        Err(e) => warn!("Version check failed: {}", e),
    }

    match control.announcement().await {
        Ok(text) if !text.trim().is_empty() => info!("Announcement: {}", text.trim()),
        Ok(_) => {}
        Err(e) => warn!("Announcement fetch failed: {}", e),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
