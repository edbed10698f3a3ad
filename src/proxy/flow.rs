//! One intercepted request/response exchange

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST};
use http::{request, Method, Request, Response, StatusCode};
use http_body_util::Full;
use uuid::Uuid;

use crate::error::{InterposeError, Result};
use crate::proxy::egress::authority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FlowResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Request state handlers may inspect and mutate, plus the upstream response
/// once it has arrived.
///
/// The method is fixed at parse time. Host, port and path may be rewritten
/// in the request phase to reroute the request.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path and query in origin form
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response: Option<FlowResponse>,
    /// Free-form markers handlers leave for their own response phase
    pub tags: Vec<String>,
    pub client_addr: Option<SocketAddr>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Flow {
    pub fn new(method: Method, scheme: Scheme, host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            scheme,
            host: host.into(),
            port,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            response: None,
            tags: Vec::new(),
            client_addr: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Build a flow from a parsed client request aimed at `host:port`
    pub fn from_parts(
        parts: request::Parts,
        body: Bytes,
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut flow = Self::new(parts.method, scheme, host, port, path);
        flow.headers = parts.headers;
        flow.body = body;
        flow
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// `host[:port]`, omitting the scheme's default port
    pub fn authority(&self) -> String {
        if self.port != self.scheme.default_port() {
            return authority(&self.host, self.port);
        }
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.path)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// The origin-form request to send upstream, without hop-by-hop headers
    pub fn to_upstream_request(&self) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.path.as_str());

        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end(&self.headers, headers);
            let host = HeaderValue::from_str(&self.authority())
                .map_err(|e| InterposeError::InvalidRequest(format!("invalid host: {}", e)))?;
            headers.insert(HOST, host);
        }

        builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| InterposeError::InvalidRequest(format!("Failed to build request: {}", e)))
    }

    /// Response to write back to the client; 502 when no upstream response was recorded
    pub fn to_client_response(&self) -> Response<Full<Bytes>> {
        let Some(upstream) = &self.response else {
            return super::handler::error_response(StatusCode::BAD_GATEWAY, "No upstream response");
        };

        let mut response = Response::new(Full::new(upstream.body.clone()));
        *response.status_mut() = upstream.status;
        copy_end_to_end(&upstream.headers, response.headers_mut());
        response
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Copy headers that survive a proxy hop. Content-Length is dropped as well
/// since handlers may change the body; the full body fixes the length on write.
fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if super::handler::is_hop_by_hop_header(name.as_str()) || name == CONTENT_LENGTH {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, PROXY_AUTHORIZATION, USER_AGENT};

    fn sample() -> Flow {
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://api.example.com:8080/v1/items?q=1")
            .header(USER_AGENT, "curl/8.0")
            .header(CONNECTION, "keep-alive")
            .header(PROXY_AUTHORIZATION, "Basic Zm9vOmJhcg==")
            .header(CONTENT_LENGTH, "5")
            .header("X-Trace", "a")
            .header("X-Trace", "b")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        Flow::from_parts(parts, Bytes::from_static(b"hello"), Scheme::Http, "api.example.com", 8080)
    }

    #[test]
    fn test_from_parts_keeps_path_and_query() {
        let flow = sample();
        assert_eq!(flow.method(), Method::POST);
        assert_eq!(flow.path, "/v1/items?q=1");
        assert_eq!(flow.url(), "http://api.example.com:8080/v1/items?q=1");
        assert_eq!(flow.user_agent(), Some("curl/8.0"));
    }

    #[test]
    fn test_default_port_is_omitted() {
        let flow = Flow::new(Method::GET, Scheme::Https, "example.com", 443, "/");
        assert_eq!(flow.authority(), "example.com");
        assert_eq!(flow.url(), "https://example.com/");

        let flow = Flow::new(Method::GET, Scheme::Http, "::1", 8080, "/x");
        assert_eq!(flow.url(), "http://[::1]:8080/x");
    }

    #[test]
    fn test_upstream_request_strips_hop_by_hop() {
        let mut flow = sample();
        flow.host = "other.example.com".to_string();
        flow.port = 80;

        let req = flow.to_upstream_request().unwrap();
        assert_eq!(req.uri(), "/v1/items?q=1");
        assert_eq!(req.headers()[HOST], "other.example.com");
        assert!(req.headers().get(CONNECTION).is_none());
        assert!(req.headers().get(PROXY_AUTHORIZATION).is_none());
        assert!(req.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(req.headers().get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn test_client_response_without_upstream_is_bad_gateway() {
        let flow = sample();
        assert_eq!(flow.to_client_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_client_response_copies_upstream() {
        let mut flow = sample();
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        flow.response = Some(FlowResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"done"),
        });
        flow.finish();

        let resp = flow.to_client_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-upstream"], "yes");
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert!(flow.duration_ms().is_some());
    }
}
