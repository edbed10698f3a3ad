//! Request and response values exchanged with the control plane

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::error::{InterposeError, Result};

/// One logical control-plane call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Overrides the client's default deadline for this call
    pub deadline: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            deadline: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize `body` as the JSON request payload
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| InterposeError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(Bytes::from(bytes));
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        Ok(self)
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Response to an [`ApiRequest`].
///
/// The body is parsed as JSON once; a body that is not valid JSON behaves
/// like an empty document, so every accessor falls back to its zero value.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    json: Value,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        Self {
            status,
            headers,
            body,
            json,
        }
    }

    /// Body decoded as UTF-8 (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> &Value {
        &self.json
    }

    /// Look up a dotted path such as `data.user.name` or `items.0.id`
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.json, path)
    }

    pub fn get_string(&self, path: &str) -> String {
        match self.get(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn get_int(&self, path: &str) -> i64 {
        match self.get(path) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => 0,
        }
    }

    pub fn get_bool(&self, path: &str) -> bool {
        match self.get(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
            _ => false,
        }
    }

    /// True for 4xx/5xx statuses or a non-empty top-level `error` field
    pub fn has_error(&self) -> bool {
        self.status.is_client_error()
            || self.status.is_server_error()
            || !self.get_string("error").is_empty()
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }

    path.split('.').try_fold(root, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> ApiResponse {
        ApiResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    #[test]
    fn test_typed_accessors() {
        let resp = response(
            r#"{"url":"https://dl.example/v2","code":0,"count":"12","ok":true,
                "nested":{"name":"n","items":[{"id":7}]}}"#,
        );

        assert_eq!(resp.get_string("url"), "https://dl.example/v2");
        assert_eq!(resp.get_int("code"), 0);
        assert_eq!(resp.get_int("count"), 12);
        assert!(resp.get_bool("ok"));
        assert_eq!(resp.get_string("nested.name"), "n");
        assert_eq!(resp.get_int("nested.items.0.id"), 7);
        assert_eq!(resp.get_string("code"), "0");
    }

    #[test]
    fn test_missing_fields_yield_zero_values() {
        let resp = response(r#"{"a":1}"#);
        assert_eq!(resp.get_string("missing"), "");
        assert_eq!(resp.get_int("missing"), 0);
        assert!(!resp.get_bool("missing"));
        assert_eq!(resp.get_string("a.b"), "");
    }

    #[test]
    fn test_malformed_json_never_panics() {
        let resp = response("<html>not json</html>");
        assert_eq!(resp.json(), &Value::Null);
        assert_eq!(resp.get_string("url"), "");
        assert_eq!(resp.get_int("code"), 0);
        assert!(!resp.get_bool("ok"));
        assert_eq!(resp.text(), "<html>not json</html>");
    }

    #[test]
    fn test_has_error() {
        assert!(!response(r#"{"error":""}"#).has_error());
        assert!(response(r#"{"error":"device banned"}"#).has_error());

        let failed = ApiResponse::new(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
        assert!(failed.has_error());
    }

    #[test]
    fn test_request_builder() {
        let req = ApiRequest::post("/my")
            .query("mode", "1")
            .header("deviceName", "host")
            .json(&serde_json::json!({"device": "d1"}))
            .unwrap()
            .deadline(Duration::from_secs(20));

        assert_eq!(req.method, Method::POST);
        assert_eq!(req.query, vec![("mode".to_string(), "1".to_string())]);
        assert!(req.has_header("content-type"));
        assert!(req.has_header("DEVICENAME"));
        assert_eq!(req.body.as_deref(), Some(&br#"{"device":"d1"}"#[..]));
        assert_eq!(req.deadline, Some(Duration::from_secs(20)));
    }
}
