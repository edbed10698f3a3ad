//! Network transport for control-plane calls

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http_body_util::Full;
use hyper::Request;
use tracing::{debug, info};
use url::{Position, Url};

use crate::client::api::{ApiRequest, ApiResponse};
use crate::config::{ControlConfig, EgressProxyConfig};
use crate::error::{InterposeError, Result};
use crate::proxy::upstream::Upstream;
use crate::tls::upstream_client_config;

/// Performs one HTTP exchange against a base URL.
///
/// Implementations return a response for every status code; only failures
/// to complete the exchange are errors. Classification into retryable and
/// fatal outcomes happens in the retrying client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, base: &str, request: &ApiRequest) -> Result<ApiResponse>;
}

/// hyper-based HTTP/1.1 transport over TCP or TLS, honoring an egress proxy
pub struct HyperTransport {
    upstream: Upstream,
    user_agent: Option<String>,
}

impl HyperTransport {
    pub fn new(
        egress: Option<EgressProxyConfig>,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        if let Some(proxy) = &egress {
            info!(proxy = %proxy.redacted(), "Control-plane requests routed through proxy");
        }

        Ok(Self {
            upstream: Upstream::new(egress, upstream_client_config(true)?, connect_timeout, timeout),
            user_agent: None,
        })
    }

    pub fn from_config(config: &ControlConfig) -> Result<Self> {
        Self::new(
            config.egress_proxy.clone(),
            config.connect_timeout(),
            config.timeout(),
        )
    }

    /// Default `User-Agent` for requests that do not set one
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, base: &str, request: &ApiRequest) -> Result<ApiResponse> {
        let url = build_url(base, request)?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(InterposeError::InvalidAddress(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| InterposeError::InvalidAddress(format!("missing host in {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| InterposeError::InvalidAddress(format!("missing port in {}", url)))?;
        let dial_host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(&url[Position::BeforePath..])
            .header(HOST, host_header);

        if let (Some(ua), false) = (&self.user_agent, request.has_header("user-agent")) {
            builder = builder.header(USER_AGENT, ua.as_str());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let http_request = builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| InterposeError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        debug!(method = %request.method, url = %url, "Sending control-plane request");

        let stream = self
            .upstream
            .connect(dial_host, port, tls)
            .await
            .map_err(into_transport)?;
        let (parts, body) = self
            .upstream
            .send(stream, http_request)
            .await
            .map_err(into_transport)?;

        Ok(ApiResponse::new(parts.status, parts.headers, body))
    }
}

/// Dial and exchange failures become retryable transport errors
fn into_transport(err: InterposeError) -> InterposeError {
    match err {
        InterposeError::UpstreamDial(msg) | InterposeError::UpstreamIo(msg) => {
            InterposeError::Transport(msg)
        }
        InterposeError::Timeout => InterposeError::Transport("request timed out".to_string()),
        other => other,
    }
}

/// Join `base` with the request path and query
pub fn build_url(base: &str, request: &ApiRequest) -> Result<Url> {
    let path = if request.path.starts_with('/') || request.path.is_empty() {
        request.path.clone()
    } else {
        format!("/{}", request.path)
    };

    let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))?;
    if !request.query.is_empty() {
        url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn json_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let ua = req
                            .headers()
                            .get(USER_AGENT)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let sign = req
                            .headers()
                            .get("sign")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = serde_json::json!({
                            "path": req.uri().path(),
                            "query": req.uri().query().unwrap_or(""),
                            "ua": ua,
                            "sign": sign,
                        });
                        let status = if req.uri().path() == "/missing" {
                            StatusCode::NOT_FOUND
                        } else {
                            StatusCode::OK
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .header("Content-Type", "application/json")
                                .body(Full::new(Bytes::from(body.to_string())))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    #[test]
    fn test_build_url() {
        let req = ApiRequest::get("/version")
            .query("version", "1.2.0")
            .query("plat", "linux_amd64");
        let url = build_url("https://api.example.com/", &req).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/version?version=1.2.0&plat=linux_amd64"
        );

        let url = build_url("http://api.example.com/v1", &ApiRequest::get("health")).unwrap();
        assert_eq!(url.as_str(), "http://api.example.com/v1/health");
        assert!(url.query().is_none());
    }

    #[tokio::test]
    async fn test_hyper_transport_round_trip() {
        let addr = json_server().await;
        let transport = HyperTransport::new(None, Duration::from_secs(2), Duration::from_secs(2))
            .unwrap()
            .with_user_agent("interpose-test");

        let req = ApiRequest::get("/version")
            .query("version", "7")
            .header("sign", "abc");
        let resp = transport
            .send(&format!("http://{}", addr), &req)
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.get_string("path"), "/version");
        assert_eq!(resp.get_string("query"), "version=7");
        assert_eq!(resp.get_string("ua"), "interpose-test");
        assert_eq!(resp.get_string("sign"), "abc");
    }

    #[tokio::test]
    async fn test_hyper_transport_returns_error_statuses() {
        let addr = json_server().await;
        let transport =
            HyperTransport::new(None, Duration::from_secs(2), Duration::from_secs(2)).unwrap();

        let resp = transport
            .send(&format!("http://{}", addr), &ApiRequest::get("/missing"))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HyperTransport::new(None, Duration::from_secs(2), Duration::from_secs(2)).unwrap();
        let err = transport
            .send(&format!("http://{}", addr), &ApiRequest::get("/health"))
            .await
            .unwrap_err();

        assert!(matches!(err, InterposeError::Transport(_)));
        assert!(err.is_retryable());
    }
}
