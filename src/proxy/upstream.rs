//! Upstream dialing and single-request relay
//!
//! Shared by the interception proxy and the control-plane transport: dial
//! `host:port` (directly or through an egress proxy), optionally wrap the
//! socket in TLS, then exchange one HTTP/1.1 request over it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::response;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::config::EgressProxyConfig;
use crate::error::{InterposeError, Result};
use crate::proxy::egress;
use crate::tls::client::server_name;

/// Any bidirectional byte stream an upstream request can run over
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

pub type BoxedStream = Box<dyn UpstreamStream>;

#[derive(Clone)]
pub struct Upstream {
    egress: Option<EgressProxyConfig>,
    tls: TlsConnector,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Upstream {
    pub fn new(
        egress: Option<EgressProxyConfig>,
        tls_config: Arc<ClientConfig>,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            egress,
            tls: TlsConnector::from(tls_config),
            connect_timeout,
            io_timeout,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Open a plain TCP connection to `host:port`
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        timeout(
            self.connect_timeout,
            egress::dial(self.egress.as_ref(), host, port),
        )
        .await
        .map_err(|_| {
            InterposeError::UpstreamDial(format!(
                "connect to {} timed out after {}s",
                egress::authority(host, port),
                self.connect_timeout.as_secs()
            ))
        })?
    }

    /// Open a connection to `host:port`, performing a TLS handshake when `tls` is set
    #[instrument(skip(self), level = "debug")]
    pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<BoxedStream> {
        let tcp = self.connect_tcp(host, port).await?;
        if !tls {
            return Ok(Box::new(tcp));
        }

        let name = server_name(host)?;
        let stream = timeout(self.connect_timeout, self.tls.connect(name, tcp))
            .await
            .map_err(|_| {
                InterposeError::UpstreamDial(format!("TLS handshake with {} timed out", host))
            })?
            .map_err(|e| {
                InterposeError::UpstreamDial(format!("TLS handshake with {} failed: {}", host, e))
            })?;

        Ok(Box::new(stream))
    }

    /// Send one request over `stream` and read the full response
    pub async fn send(
        &self,
        stream: BoxedStream,
        request: Request<Full<Bytes>>,
    ) -> Result<(response::Parts, Bytes)> {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| InterposeError::UpstreamIo(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| InterposeError::UpstreamIo(format!("request failed: {}", e)))?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    InterposeError::UpstreamIo(format!("failed to read response: {}", e))
                })?
                .to_bytes();

            Ok::<_, InterposeError>((parts, body))
        };

        timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| InterposeError::Timeout)?
    }
}
