//! CONNECT tunnel handling
//!
//! After the proxy answers a CONNECT with 200, the upgraded client stream is
//! either terminated with a leaf certificate for the target host and served
//! as HTTPS through the handler chain, or relayed byte-for-byte to the target
//! when interception is disabled or not possible.
//!
//! A client that aborts the intercepted handshake (certificate pinning, a
//! private trust store) puts its host on the passthrough list, and every
//! later tunnel to that host is relayed raw.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_rustls::rustls::{self, server::Acceptor};
use tracing::{debug, info, instrument, warn};

use crate::error::{InterposeError, Result};
use crate::proxy::handler::ProxyHandler;
use crate::proxy::rewind::Rewind;

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;

/// Longest wait for the client's first bytes before assuming a
/// server-speaks-first protocol and relaying raw
const FIRST_BYTES_WAIT: Duration = Duration::from_secs(5);

const PEEK_BUFFER: usize = 4096;
const COPY_BUFFER: usize = 16 * 1024;

/// Serve one upgraded CONNECT stream to `host:port`
#[instrument(skip(handler, client))]
pub async fn serve<I>(
    handler: Arc<ProxyHandler>,
    mut client: I,
    host: String,
    port: u16,
    client_addr: SocketAddr,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(authority) = handler.authority() else {
        return raw(&handler, client, &host, port).await;
    };
    if handler.is_passthrough(&host) {
        debug!("Host is on the passthrough list, relaying raw");
        return raw(&handler, client, &host, port).await;
    }

    let wait = handler.io_timeout().min(FIRST_BYTES_WAIT);
    let mut buf = vec![0u8; PEEK_BUFFER];
    let n = match timeout(wait, client.read(&mut buf)).await {
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => 0,
    };
    buf.truncate(n);
    let prefix = Bytes::from(buf);
    let client = Rewind::new(prefix.clone(), client);

    if prefix.first() != Some(&TLS_HANDSHAKE) {
        debug!("Tunnel payload is not TLS, relaying raw");
        return raw(&handler, client, &host, port).await;
    }

    // Nothing has been written to the client yet, so a hello we cannot
    // terminate can still be replayed to the real server.
    if let Err(e) = check_client_hello(&prefix) {
        warn!(error = %e, "ClientHello rejected, relaying raw");
        return raw(&handler, client, &host, port).await;
    }

    let leaf = match authority.get_leaf(&host) {
        Ok(leaf) => leaf,
        Err(e) => {
            warn!(error = %e, "Leaf certificate unavailable, relaying raw");
            return raw(&handler, client, &host, port).await;
        }
    };

    let tls = match timeout(handler.io_timeout(), leaf.acceptor().accept(client)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            if handler.mark_passthrough(&host) {
                warn!(error = %e, "Client refused intercepted handshake, host now relayed raw");
            }
            return Err(InterposeError::Handshake(format!("{}: {}", host, e)));
        }
        Err(_) => {
            return Err(InterposeError::Handshake(format!(
                "{}: client handshake timed out",
                host
            )))
        }
    };

    debug!(serial = leaf.serial, "TLS interception established");

    let io_timeout = handler.io_timeout();
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let host = host.clone();
        async move {
            Ok::<_, Infallible>(
                handler
                    .handle_intercepted(req, &host, port, client_addr)
                    .await,
            )
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(io_timeout)
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(|e| InterposeError::UpstreamIo(format!("intercepted session ended: {}", e)))
}

/// Parse the buffered ClientHello the way the TLS acceptor will.
/// An incomplete hello is not an error; the acceptor reads the rest.
fn check_client_hello(prefix: &[u8]) -> std::result::Result<(), rustls::Error> {
    let mut acceptor = Acceptor::default();
    let mut reader = prefix;
    while !reader.is_empty() {
        match acceptor.read_tls(&mut reader) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        match acceptor.accept() {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => {}
            Err((e, _alert)) => return Err(e),
        }
    }
    Ok(())
}

async fn raw<I>(handler: &ProxyHandler, client: I, host: &str, port: u16) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    let server = handler.upstream().connect_tcp(host, port).await?;
    let (sent, received) = relay(client, server, handler.io_timeout()).await;
    info!(host, port, bytes_sent = sent, bytes_received = received, "Raw tunnel closed");
    Ok(())
}

/// Copy bytes both ways until both sides finish, either side fails, or no
/// byte moves for `idle`. Returns (client→server, server→client) byte counts.
pub async fn relay<C, S>(client: C, server: S, idle: Duration) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let last_activity = Mutex::new(Instant::now());
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let transfer = async {
        let (up, down) = tokio::join!(
            pump(client_read, server_write, &sent, &last_activity),
            pump(server_read, client_write, &received, &last_activity),
        );
        if let Err(e) = up {
            debug!("Client to server copy ended: {}", e);
        }
        if let Err(e) = down {
            debug!("Server to client copy ended: {}", e);
        }
    };

    let watchdog = async {
        loop {
            let deadline = *last_activity.lock() + idle;
            if Instant::now() >= deadline {
                break;
            }
            sleep_until(deadline).await;
        }
    };

    tokio::select! {
        _ = transfer => {}
        _ = watchdog => debug!(idle_secs = idle.as_secs(), "Tunnel idle timeout"),
    }

    (sent.load(Ordering::Relaxed), received.load(Ordering::Relaxed))
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    last_activity: &Mutex<Instant>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        // A socket read deadline only means this direction is quiet; the
        // relay's idle watchdog decides when the tunnel as a whole is dead.
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        *last_activity.lock() = Instant::now();
    }
    writer.shutdown().await
}
