//! Per-request proxy logic
//!
//! Dispatches CONNECT requests to the tunnel, runs absolute-form HTTP
//! requests through the handler chain and upstream, and serves the root
//! certificate to clients that ask the proxy directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{InterposeError, Result};
use crate::proxy::chain::HandlerChain;
use crate::proxy::flow::{Flow, FlowResponse, Scheme};
use crate::proxy::server::ConnectionRegistry;
use crate::proxy::tunnel;
use crate::proxy::upstream::Upstream;
use crate::tls::CertAuthority;

/// Path under which the proxy serves its root certificate
pub const CA_CERT_PATH: &str = "/ca.pem";

pub struct ProxyHandler {
    chain: Arc<HandlerChain>,
    /// `None` disables TLS interception; CONNECT tunnels are relayed raw
    authority: Option<Arc<CertAuthority>>,
    upstream: Upstream,
    connections: ConnectionRegistry,
    io_timeout: Duration,
    /// Hosts whose clients refused our leaf; their tunnels are relayed raw
    passthrough: DashSet<String>,
}

impl ProxyHandler {
    pub fn new(
        chain: Arc<HandlerChain>,
        authority: Option<Arc<CertAuthority>>,
        upstream: Upstream,
        connections: ConnectionRegistry,
        io_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            authority,
            upstream,
            connections,
            io_timeout,
            passthrough: DashSet::new(),
        }
    }

    pub fn authority(&self) -> Option<&Arc<CertAuthority>> {
        self.authority.as_ref()
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Whether CONNECTs to `host` skip interception
    pub fn is_passthrough(&self, host: &str) -> bool {
        self.passthrough.contains(&host.to_ascii_lowercase())
    }

    /// Relay future tunnels to `host` raw; true if the host was newly added
    pub fn mark_passthrough(&self, host: &str) -> bool {
        self.passthrough.insert(host.to_ascii_lowercase())
    }

    /// Handle a request read from a client connection to the proxy
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, client_addr);
        }

        if req.uri().authority().is_some() {
            return self.handle_http(req, client_addr).await;
        }

        if req.method() == Method::GET && req.uri().path() == CA_CERT_PATH {
            return Ok(self.ca_response());
        }

        debug!("Rejecting origin-form request sent to the proxy itself");
        Ok(error_response(
            StatusCode::BAD_REQUEST,
            "This is a proxy; send absolute-form or CONNECT requests",
        ))
    }

    /// Answer 200 at once, then serve the upgraded stream on a tracked task.
    /// No upstream dial happens before the client sees the 200.
    fn handle_connect(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let (host, port) = connect_target(&req)?;
        debug!(host = %host, port, client = %client_addr, "CONNECT accepted");

        let on_upgrade = hyper::upgrade::on(req);
        let handler = self.clone();
        self.connections.spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    if let Err(e) = tunnel::serve(handler, client, host, port, client_addr).await {
                        debug!("CONNECT tunnel ended: {}", e);
                    }
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        let mut response = Response::new(Full::new(Bytes::new()));
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }

    /// Handle an absolute-form plain HTTP request
    async fn handle_http(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri();
        let scheme = match uri.scheme_str() {
            Some("https") => Scheme::Https,
            Some("http") | None => Scheme::Http,
            Some(other) => {
                return Err(InterposeError::InvalidRequest(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        let host = uri
            .host()
            .map(|h| strip_brackets(h).to_string())
            .ok_or_else(|| InterposeError::InvalidRequest(format!("missing host in {}", uri)))?;
        let port = uri.port_u16().unwrap_or(scheme.default_port());

        let (parts, body) = req.into_parts();
        let body = self.read_body(body).await?;

        let mut flow = Flow::from_parts(parts, body, scheme, host, port);
        flow.client_addr = Some(client_addr);
        self.forward(flow).await
    }

    /// Handle a request decrypted from an intercepted CONNECT tunnel to `host:port`
    pub async fn handle_intercepted(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
        client_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let result = match self.read_body(body).await {
            Ok(body) => {
                let mut flow = Flow::from_parts(parts, body, Scheme::Https, host, port);
                flow.client_addr = Some(client_addr);
                self.forward(flow).await
            }
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            warn!(host, error = %e, "Intercepted request failed");
            error_response(e.status_code(), &e.to_string())
        })
    }

    /// Run the request phase, relay upstream, run the response phase
    async fn forward(&self, mut flow: Flow) -> Result<Response<Full<Bytes>>> {
        self.chain.run_request_phase(&mut flow);

        let request = flow.to_upstream_request()?;
        let tls = flow.scheme == Scheme::Https;
        let stream = self.upstream.connect(&flow.host, flow.port, tls).await?;
        let (parts, body) = self.upstream.send(stream, request).await?;

        flow.response = Some(FlowResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        });
        self.chain.run_response_phase(&mut flow);
        flow.finish();

        info!(
            flow_id = %flow.id,
            method = %flow.method(),
            url = %flow.url(),
            status = flow.response.as_ref().map(|r| r.status.as_u16()).unwrap_or_default(),
            duration_ms = flow.duration_ms().unwrap_or_default(),
            "Flow completed"
        );

        Ok(flow.to_client_response())
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes> {
        let collected = timeout(self.io_timeout, body.collect())
            .await
            .map_err(|_| InterposeError::Timeout)?
            .map_err(|e| InterposeError::InvalidRequest(format!("Failed to read body: {}", e)))?;
        Ok(collected.to_bytes())
    }

    fn ca_response(&self) -> Response<Full<Bytes>> {
        let Some(authority) = &self.authority else {
            return error_response(StatusCode::NOT_FOUND, "TLS interception is disabled");
        };

        let mut response = Response::new(Full::new(Bytes::from(authority.root_pem().to_string())));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-pem-file"),
        );
        response
    }
}

fn connect_target(req: &Request<Incoming>) -> Result<(String, u16)> {
    let authority = req.uri().authority().ok_or_else(|| {
        InterposeError::InvalidRequest(format!("CONNECT target must be host:port, got {}", req.uri()))
    })?;
    let port = authority.port_u16().ok_or_else(|| {
        InterposeError::InvalidRequest(format!("CONNECT target {} has no port", authority))
    })?;
    Ok((strip_brackets(authority.host()).to_string(), port))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Plain-text response carrying `status`
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
