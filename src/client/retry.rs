//! Retrying control-plane client
//!
//! One logical call runs up to `max_retries + 1` attempts against the active
//! host with linear backoff (`retry_delay * attempt`). The whole call is bound
//! by a deadline; when it expires the in-flight attempt is dropped and the
//! call fails with [`InterposeError::Timeout`].
//!
//! Breaker policy: transport failures and 5xx responses count as failures;
//! any other response counts as success. A 4xx is still returned to the
//! caller as [`InterposeError::Client`] and never retried.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::client::api::{ApiRequest, ApiResponse};
use crate::client::breaker::CircuitBreaker;
use crate::client::hosts::HostSelector;
use crate::client::transport::Transport;
use crate::config::ControlConfig;
use crate::error::{InterposeError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Default deadline for a call that does not set its own
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            deadline: Duration::from_secs(15),
        }
    }
}

pub struct RetryingClient {
    transport: Arc<dyn Transport>,
    hosts: HostSelector,
    breaker: Option<CircuitBreaker>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        hosts: HostSelector,
        breaker: Option<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            hosts,
            breaker,
            policy,
        }
    }

    pub fn from_config(config: &ControlConfig, transport: Arc<dyn Transport>) -> Self {
        let hosts = HostSelector::new(
            config.hosts.clone(),
            config.check_path.clone(),
            config.check_timeout(),
        );
        let breaker = config
            .circuit_breaker
            .then(|| CircuitBreaker::new(config.breaker_threshold, config.breaker_timeout()));
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            deadline: config.deadline(),
        };

        Self::new(transport, hosts, breaker, policy)
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn hosts(&self) -> &HostSelector {
        &self.hosts
    }

    /// Explicitly re-check the candidate hosts
    pub async fn select_host(&self) -> Option<String> {
        self.hosts.select_active_host(self.transport.as_ref()).await
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        if !self.admit() {
            debug!("Rejected by open circuit breaker");
            return Err(InterposeError::CircuitOpen);
        }

        let base = match self.hosts.active_host() {
            Some(host) => host,
            None => self
                .select_host()
                .await
                .ok_or(InterposeError::NoActiveHost)?,
        };

        let deadline = request.deadline.unwrap_or(self.policy.deadline);
        match timeout(deadline, self.attempts(&base, &request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Control-plane call deadline exceeded");
                Err(InterposeError::Timeout)
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.request(ApiRequest::post(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::delete(path)).await
    }

    async fn attempts(&self, base: &str, request: &ApiRequest) -> Result<ApiResponse> {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.admit() {
                warn!(attempt, "Circuit breaker opened during retries");
                return Err(InterposeError::CircuitOpen);
            }

            let error = match self.transport.send(base, request).await {
                Ok(response) if response.status.is_server_error() => {
                    self.record_failure();
                    InterposeError::Server {
                        status: response.status,
                        body: response.text(),
                    }
                }
                Ok(response) if response.status.is_client_error() => {
                    self.record_success();
                    return Err(InterposeError::Client {
                        status: response.status,
                        body: response.text(),
                    });
                }
                Ok(response) => {
                    self.record_success();
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    self.record_failure();
                    e
                }
                Err(e) => return Err(e),
            };

            warn!(
                attempt,
                max_attempts,
                error = %error,
                "Control-plane attempt failed"
            );
            last_error = Some(error);

            if attempt < max_attempts {
                sleep(self.policy.retry_delay * attempt).await;
            }
        }

        Err(InterposeError::RetriesExhausted {
            attempts: max_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| InterposeError::Internal("no attempt made".into())),
            ),
        })
    }

    fn admit(&self) -> bool {
        self.breaker.as_ref().map_or(true, |b| b.try_acquire())
    }

    fn record_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.on_success();
        }
    }

    fn record_failure(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.on_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::breaker::BreakerState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    enum Step {
        Status(u16),
        Fail,
        Hang,
    }

    /// Replays a script of outcomes; the last step repeats forever
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _base: &str, _request: &ApiRequest) -> Result<ApiResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let mut steps = self.steps.lock();
                match steps.len() {
                    0 => Step::Fail,
                    1 => match steps.front() {
                        Some(Step::Status(code)) => Step::Status(*code),
                        Some(Step::Hang) => Step::Hang,
                        _ => Step::Fail,
                    },
                    _ => steps.pop_front().unwrap_or(Step::Fail),
                }
            };

            match step {
                Step::Status(code) => Ok(ApiResponse::new(
                    StatusCode::from_u16(code).unwrap(),
                    HeaderMap::new(),
                    Bytes::from_static(br#"{"ok":true}"#),
                )),
                Step::Fail => Err(InterposeError::Transport("connection reset".to_string())),
                Step::Hang => {
                    sleep(Duration::from_secs(3600)).await;
                    Err(InterposeError::Transport("unreachable".to_string()))
                }
            }
        }
    }

    fn client(transport: Arc<Scripted>, max_retries: u32, threshold: u32) -> RetryingClient {
        RetryingClient::new(
            transport,
            HostSelector::new(
                vec!["http://control.test".to_string()],
                "/health",
                Duration::from_secs(4),
            ),
            Some(CircuitBreaker::new(threshold, Duration::from_secs(30))),
            RetryPolicy {
                max_retries,
                retry_delay: Duration::from_secs(1),
                deadline: Duration::from_secs(60),
            },
        )
    }

    /// Active host already chosen so checks do not consume scripted steps
    async fn ready(client: RetryingClient) -> RetryingClient {
        client.hosts().pin_active("http://control.test");
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_server_errors() {
        let transport = Scripted::new(vec![Step::Status(503), Step::Status(503), Step::Status(200)]);
        let client = ready(client(transport.clone(), 3, 5)).await;

        let start = Instant::now();
        let response = client.get("/version").await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.calls(), 3);
        // Linear backoff: 1s after attempt 1, 2s after attempt 2.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

        let breaker = client.breaker().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let transport = Scripted::new(vec![Step::Status(404)]);
        let client = ready(client(transport.clone(), 3, 5)).await;

        let err = client.get("/missing").await.unwrap_err();

        assert!(matches!(
            err,
            InterposeError::Client { status, .. } if status == StatusCode::NOT_FOUND
        ));
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.breaker().unwrap().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_last_failure() {
        let transport = Scripted::new(vec![Step::Fail, Step::Status(500)]);
        let client = ready(client(transport.clone(), 2, 10)).await;

        let err = client.get("/version").await.unwrap_err();

        match err {
            InterposeError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, InterposeError::Server { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
        assert_eq!(client.breaker().unwrap().failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_network() {
        let transport = Scripted::new(vec![Step::Status(200)]);
        let client = ready(client(transport.clone(), 3, 1)).await;
        client.breaker().unwrap().on_failure();

        let err = client.get("/version").await.unwrap_err();

        assert!(matches!(err, InterposeError::CircuitOpen));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_call_stops_retries() {
        let transport = Scripted::new(vec![Step::Status(503)]);
        let client = ready(client(transport.clone(), 5, 2)).await;

        let err = client.get("/version").await.unwrap_err();

        assert!(matches!(err, InterposeError::CircuitOpen));
        assert_eq!(transport.calls(), 2);
        assert_eq!(client.breaker().unwrap().state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_in_flight_attempt() {
        let transport = Scripted::new(vec![Step::Hang]);
        let client = ready(client(transport.clone(), 3, 5)).await;

        let request = ApiRequest::get("/slow").deadline(Duration::from_secs(2));
        let err = client.request(request).await.unwrap_err();

        assert!(matches!(err, InterposeError::Timeout));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_host_on_first_call() {
        let transport = Scripted::new(vec![Step::Status(200)]);
        let client = client(transport.clone(), 0, 5);
        assert_eq!(client.hosts().active_host(), None);

        client.get("/version").await.unwrap();

        assert_eq!(
            client.hosts().active_host().as_deref(),
            Some("http://control.test")
        );
        // One check plus the call itself.
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_candidates_is_no_active_host() {
        let transport = Scripted::new(vec![Step::Status(200)]);
        let client = RetryingClient::new(
            transport,
            HostSelector::new(Vec::new(), "/health", Duration::from_secs(1)),
            None,
            RetryPolicy::default(),
        );

        assert!(matches!(
            client.get("/version").await,
            Err(InterposeError::NoActiveHost)
        ));
    }
}
