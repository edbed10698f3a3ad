//! Proxy server lifecycle
//!
//! Owns the listener and every connection task. `start` binds and spawns the
//! accept loop; `stop` closes the listener, lets in-flight connections finish
//! within a grace period, then aborts whatever is left.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ProxyServerConfig;
use crate::error::{InterposeError, Result};
use crate::proxy::chain::{FlowHandler, HandlerChain};
use crate::proxy::deadline::Deadline;
use crate::proxy::handler::{error_response, ProxyHandler};
use crate::proxy::upstream::Upstream;
use crate::tls::CertAuthority;

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long aborted connections get to unwind before `stop` gives up
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Tracks spawned connection and tunnel tasks so they can be drained or aborted
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tasks: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
    active: watch::Sender<usize>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(0),
                active,
            }),
        }
    }

    /// Spawn `task`, counting it as active until it completes or is aborted
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active.send_modify(|n| *n += 1);

        let guard = TaskGuard {
            registry: self.inner.clone(),
            id,
        };
        // Held at the gate until its abort handle is registered.
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if start_rx.await.is_ok() {
                task.await;
            }
        });

        self.inner.tasks.insert(id, handle.abort_handle());
        let _ = start_tx.send(());
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn active(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Wait until no task is active; false if `limit` passed first
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.inner.active.subscribe();
        timeout(limit, async move {
            let _ = rx.wait_for(|n| *n == 0).await;
        })
        .await
        .is_ok()
    }

    /// Abort every tracked task; returns how many were signalled
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for entry in self.inner.tasks.iter() {
            entry.value().abort();
            aborted += 1;
        }
        aborted
    }
}

struct TaskGuard {
    registry: Arc<RegistryInner>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.tasks.remove(&self.id);
        self.registry
            .active
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    chain: Arc<HandlerChain>,
    handler: Arc<ProxyHandler>,
    connections: ConnectionRegistry,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl ProxyServer {
    /// Create a new proxy server. Without an authority, CONNECT tunnels are
    /// relayed without inspection.
    pub fn new(
        config: ProxyServerConfig,
        authority: Option<Arc<CertAuthority>>,
        chain: Arc<HandlerChain>,
        upstream: Upstream,
    ) -> Self {
        let connections = ConnectionRegistry::new();
        let handler = Arc::new(ProxyHandler::new(
            chain.clone(),
            authority,
            upstream,
            connections.clone(),
            config.io_timeout(),
        ));

        Self {
            config,
            chain,
            handler,
            connections,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Register a handler; it applies to flows that start after this call
    pub fn add_handler(&self, handler: Arc<dyn FlowHandler>) {
        info!(handler = handler.name(), "Registered flow handler");
        self.chain.add_handler(handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|s| s.local_addr)
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    /// Bind `bind` and start accepting; returns the bound address
    pub async fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(InterposeError::AlreadyRunning);
        }

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| InterposeError::Bind {
                addr: bind.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);

        let accept = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.connections.clone(),
            shutdown_rx,
            self.config.io_timeout(),
            self.running.clone(),
        ));

        let previous = self.state.lock().replace(Running {
            shutdown,
            accept,
            local_addr,
        });
        if let Some(previous) = previous {
            previous.accept.abort();
        }

        info!("Proxy server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, drain connections for up to `grace`, then force-close the rest
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let Some(running) = self.state.lock().take() else {
            return Ok(());
        };

        info!(grace_secs = grace.as_secs(), "Proxy server shutting down");
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept.await {
            if e.is_panic() {
                error!("Accept loop panicked: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);

        if self.connections.wait_idle(grace).await {
            info!("All connections drained");
            return Ok(());
        }

        let aborted = self.connections.abort_all();
        warn!(aborted, "Grace period elapsed, force-closing connections");

        if self.connections.wait_idle(ABORT_WAIT).await {
            Ok(())
        } else {
            Err(InterposeError::Shutdown(format!(
                "{} connections still open after force close",
                self.connections.active()
            )))
        }
    }
}

/// Clears the running flag when the accept loop exits for any reason
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    connections: ConnectionRegistry,
    mut shutdown: watch::Receiver<bool>,
    io_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    let _running = RunningFlag(running);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, client_addr)) => {
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            handle_connection(stream, client_addr, handler, shutdown, io_timeout).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Accept loop stopping");
                    break;
                }
            }
        }
    }
}

/// Serve HTTP/1.1 on one client connection until it closes or shutdown is signalled
async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    mut shutdown: watch::Receiver<bool>,
    io_timeout: Duration,
) {
    let stream = Deadline::new(stream, Some(io_timeout), Some(io_timeout));
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move {
            match handler.handle(req, client_addr).await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(e) => {
                    debug!(client = %client_addr, error = %e, "Request failed");
                    Ok(error_response(e.status_code(), &e.to_string()))
                }
            }
        }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(io_timeout)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
        } => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(client = %client_addr, "Connection error: {}", e);
    }
}
