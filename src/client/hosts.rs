//! Active host selection among configured control-plane candidates

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::api::ApiRequest;
use crate::client::transport::Transport;

pub struct HostSelector {
    candidates: Vec<String>,
    check_path: String,
    check_timeout: Duration,
    active: RwLock<Option<String>>,
    /// Serializes re-checks so concurrent callers see one consistent result
    selecting: Mutex<()>,
}

impl HostSelector {
    pub fn new(
        candidates: Vec<String>,
        check_path: impl Into<String>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            candidates,
            check_path: check_path.into(),
            check_timeout,
            active: RwLock::new(None),
            selecting: Mutex::new(()),
        }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Currently selected host, `None` until the first check
    pub fn active_host(&self) -> Option<String> {
        self.active.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn pin_active(&self, host: &str) {
        *self.active.write() = Some(host.to_string());
    }

    /// Check candidates in order and select the first that answers.
    ///
    /// Any HTTP response counts as alive. When no candidate answers, the first
    /// candidate is selected anyway so callers still have a target. Returns
    /// `None` only when there are no candidates.
    pub async fn select_active_host(&self, transport: &dyn Transport) -> Option<String> {
        let _selecting = self.selecting.lock().await;

        let first = self.candidates.first()?.clone();
        let check = ApiRequest::get(self.check_path.clone());

        let mut selected = None;
        for candidate in &self.candidates {
            match timeout(self.check_timeout, transport.send(candidate, &check)).await {
                Ok(Ok(response)) => {
                    debug!(host = %candidate, status = %response.status, "Host check answered");
                    selected = Some(candidate.clone());
                    break;
                }
                Ok(Err(e)) => debug!(host = %candidate, error = %e, "Host check failed"),
                Err(_) => debug!(host = %candidate, "Host check timed out"),
            }
        }

        let host = match selected {
            Some(host) => {
                info!(host = %host, "Selected active control host");
                host
            }
            None => {
                warn!(host = %first, "No control host answered, falling back to first candidate");
                first
            }
        };

        *self.active.write() = Some(host.clone());
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api::ApiResponse;
    use crate::error::{InterposeError, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::collections::HashSet;

    struct Reachability {
        up: HashSet<String>,
        hang: HashSet<String>,
        checked: parking_lot::Mutex<Vec<String>>,
    }

    impl Reachability {
        fn new(up: &[&str]) -> Self {
            Self {
                up: up.iter().map(|s| s.to_string()).collect(),
                hang: HashSet::new(),
                checked: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for Reachability {
        async fn send(&self, base: &str, request: &ApiRequest) -> Result<ApiResponse> {
            assert_eq!(request.path, "/health");
            self.checked.lock().push(base.to_string());

            if self.hang.contains(base) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.up.contains(base) {
                Ok(ApiResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new()))
            } else {
                Err(InterposeError::Transport("connection refused".to_string()))
            }
        }
    }

    fn selector() -> HostSelector {
        HostSelector::new(
            vec!["http://a".into(), "http://b".into(), "http://c".into()],
            "/health",
            Duration::from_secs(4),
        )
    }

    #[tokio::test]
    async fn test_selects_first_reachable_candidate() {
        let hosts = selector();
        let transport = Reachability::new(&["http://b", "http://c"]);

        assert_eq!(hosts.active_host(), None);
        let selected = hosts.select_active_host(&transport).await;

        assert_eq!(selected.as_deref(), Some("http://b"));
        assert_eq!(hosts.active_host().as_deref(), Some("http://b"));
        // Probing stops at the first live host.
        assert_eq!(*transport.checked.lock(), vec!["http://a", "http://b"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_first_candidate_when_all_down() {
        let hosts = selector();
        let transport = Reachability::new(&[]);

        let selected = hosts.select_active_host(&transport).await;
        assert_eq!(selected.as_deref(), Some("http://a"));
        assert_eq!(transport.checked.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let hosts = HostSelector::new(Vec::new(), "/health", Duration::from_secs(4));
        let transport = Reachability::new(&[]);
        assert_eq!(hosts.select_active_host(&transport).await, None);
        assert_eq!(hosts.active_host(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_candidate_is_skipped_after_timeout() {
        let hosts = selector();
        let mut transport = Reachability::new(&["http://b"]);
        transport.hang.insert("http://a".to_string());

        let selected = hosts.select_active_host(&transport).await;
        assert_eq!(selected.as_deref(), Some("http://b"));
    }

    #[tokio::test]
    async fn test_recheck_is_explicit() {
        let hosts = selector();
        hosts
            .select_active_host(&Reachability::new(&["http://c"]))
            .await;
        assert_eq!(hosts.active_host().as_deref(), Some("http://c"));

        // Reading never re-checks; only an explicit call replaces the host.
        assert_eq!(hosts.active_host().as_deref(), Some("http://c"));
        hosts
            .select_active_host(&Reachability::new(&["http://a"]))
            .await;
        assert_eq!(hosts.active_host().as_deref(), Some("http://a"));
    }
}
