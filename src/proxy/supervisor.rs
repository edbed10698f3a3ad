//! Keeps the proxy server running
//!
//! Polls [`ProxyServer::is_running`] and restarts the server whenever it is
//! down, backing off exponentially between failed starts. Retries are
//! unbounded; only a shutdown signal ends the loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::Result;
use crate::proxy::server::ProxyServer;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub bind: SocketAddr,
    /// Delay after the first failed start; doubles per consecutive failure
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How often a running server is checked
    pub check_interval: Duration,
    /// Grace period handed to [`ProxyServer::stop`] on shutdown
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            check_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn from_proxy_config(bind: SocketAddr, config: &ProxyServerConfig) -> Self {
        Self {
            shutdown_grace: config.shutdown_grace(),
            ..Self::new(bind)
        }
    }

    /// Delay before the next start after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

pub struct ProxySupervisor {
    server: Arc<ProxyServer>,
    config: SupervisorConfig,
    failures: AtomicU32,
    restarts: AtomicU32,
}

impl ProxySupervisor {
    pub fn new(server: Arc<ProxyServer>, config: SupervisorConfig) -> Self {
        Self {
            server,
            config,
            failures: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn server(&self) -> &Arc<ProxyServer> {
        &self.server
    }

    /// Consecutive failed starts since the last successful one
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Times the server was started again after having run
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` turns true, then stop the server
    #[instrument(skip(self, shutdown), fields(bind = %self.config.bind))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut started_once = false;

        loop {
            let delay = if self.server.is_running() {
                self.config.check_interval
            } else {
                if started_once {
                    warn!("Proxy server stopped unexpectedly, restarting");
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                }

                match self.server.start(self.config.bind).await {
                    Ok(addr) => {
                        let failures = self.failures.swap(0, Ordering::Relaxed);
                        if failures > 0 {
                            info!(%addr, failures, "Proxy server recovered");
                        }
                        started_once = true;
                        self.config.check_interval
                    }
                    Err(e) => {
                        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                        let delay = self.config.backoff(failures);
                        warn!(
                            attempt = failures,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Proxy server failed to start"
                        );
                        // A failed start is not a restart of a running server.
                        started_once = false;
                        delay
                    }
                }
            };

            let stop = tokio::select! {
                _ = sleep(delay) => false,
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => true,
            };
            if stop {
                break;
            }
        }

        info!("Supervisor shutting down");
        self.server.stop(self.config.shutdown_grace).await
    }
}

/// Signals a running supervisor to stop
pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SupervisorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for SupervisorHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::chain::HandlerChain;
    use crate::proxy::upstream::Upstream;
    use crate::tls::upstream_client_config;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn server() -> Arc<ProxyServer> {
        let upstream = Upstream::new(
            None,
            upstream_client_config(true).unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        Arc::new(ProxyServer::new(
            ProxyServerConfig::default(),
            None,
            Arc::new(HandlerChain::new()),
            upstream,
        ))
    }

    fn fast(bind: SocketAddr) -> SupervisorConfig {
        SupervisorConfig {
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            check_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(100),
            ..SupervisorConfig::new(bind)
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = SupervisorConfig::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(7), Duration::from_secs(60));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_restarts_after_bind_failure() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let supervisor = Arc::new(ProxySupervisor::new(server(), fast(addr)));
        let (handle, rx) = SupervisorHandle::new();
        let task = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!supervisor.server().is_running());
        assert!(supervisor.consecutive_failures() >= 2);

        drop(blocker);
        timeout(Duration::from_secs(2), async {
            while !supervisor.server().is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never came up");
        assert_eq!(supervisor.consecutive_failures(), 0);
        assert_eq!(supervisor.server().local_addr(), Some(addr));

        handle.shutdown();
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!supervisor.server().is_running());
    }

    #[tokio::test]
    async fn test_restarts_after_unexpected_stop() {
        let supervisor = Arc::new(ProxySupervisor::new(
            server(),
            fast("127.0.0.1:0".parse().unwrap()),
        ));
        let (handle, rx) = SupervisorHandle::new();
        let task = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run(rx).await }
        });

        timeout(Duration::from_secs(2), async {
            while !supervisor.server().is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never came up");
        assert_eq!(supervisor.restarts(), 0);

        // Stopped behind the supervisor's back, as a crashed accept loop would be.
        supervisor.server().stop(Duration::from_millis(50)).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while supervisor.restarts() == 0 || !supervisor.server().is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server was not restarted");
        assert_eq!(supervisor.restarts(), 1);
        assert_eq!(supervisor.consecutive_failures(), 0);
        let second = supervisor.server().local_addr().unwrap();
        assert!(tokio::net::TcpStream::connect(second).await.is_ok());

        handle.shutdown();
        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!supervisor.server().is_running());
    }
}
