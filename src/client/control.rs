//! Typed control-plane operations
//!
//! Wraps a [`RetryingClient`] with the identity headers the backend expects,
//! a per-operation deadline, and call metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::api::{ApiRequest, ApiResponse};
use crate::client::retry::RetryingClient;
use crate::client::transport::HyperTransport;
use crate::config::{ControlConfig, IdentityConfig};
use crate::error::{InterposeError, Result};

/// Produces the opaque `sign` value for a device identifier
pub trait Signer: Send + Sync {
    fn sign(&self, device_id: &str) -> String;
}

impl<F> Signer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn sign(&self, device_id: &str) -> String {
        self(device_id)
    }
}

/// Signer returning a precomputed value regardless of input
#[derive(Debug, Clone)]
pub struct StaticSigner(pub String);

impl Signer for StaticSigner {
    fn sign(&self, _device_id: &str) -> String {
        self.0.clone()
    }
}

/// Identity fields encoded into the `User-Agent` header as JSON
#[derive(Debug, Clone, Serialize)]
pub struct ClientIdentity {
    pub lang: String,
    pub os: String,
    pub arch: String,
    pub version: u32,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "machineID")]
    pub machine_id: String,
    pub sign: String,
    pub mode: i64,
    #[serde(skip)]
    pub promotion: String,
    #[serde(skip)]
    pub device_name: String,
}

impl ClientIdentity {
    pub fn new(config: &IdentityConfig, version: u32, signer: &dyn Signer) -> Self {
        let (os, arch) = platform();
        Self {
            lang: config.lang.clone(),
            os: os.to_string(),
            arch: arch.to_string(),
            version,
            device_id: config.device_id.clone(),
            machine_id: config.machine_id.clone(),
            sign: signer.sign(&config.device_id),
            mode: config.mode,
            promotion: config.promotion.clone(),
            device_name: device_name(),
        }
    }

    pub fn user_agent(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// OS and architecture names as the control plane expects them
pub fn platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    (os, arch)
}

/// Pack a `major.minor.patch` version into the numeric form the control
/// plane compares, e.g. `1.4.2` becomes `10402`. Missing or non-numeric
/// components count as zero.
pub fn numeric_version(version: &str) -> u32 {
    let mut parts = version
        .trim_start_matches('v')
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0).min(99);
    let patch = parts.next().unwrap_or(0).min(99);
    major
        .saturating_mul(10_000)
        .saturating_add(minor * 100 + patch)
}

fn device_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    total_latency_ms: AtomicU64,
    last_request: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_latency_ms: u64,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl ClientMetrics {
    fn record(&self, started: Instant, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        *self.last_request.lock() = Some(Utc::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            request_count: requests,
            success_count: self.successes.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            average_latency_ms: if requests == 0 { 0 } else { total / requests },
            last_request_time: *self.last_request.lock(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    pub ok: bool,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountInfo {
    pub usage_count: String,
    pub paid_usage_count: String,
    pub is_paid: String,
    pub ticket: String,
    pub expires_at: String,
    pub exclusive_at: String,
    pub token: String,
    pub quota: String,
    pub message: String,
}

impl AccountInfo {
    fn from_response(resp: &ApiResponse) -> Self {
        Self {
            usage_count: resp.get_string("sCount"),
            paid_usage_count: resp.get_string("sPayCount"),
            is_paid: resp.get_string("isPay"),
            ticket: resp.get_string("ticket"),
            expires_at: resp.get_string("exp"),
            exclusive_at: resp.get_string("exclusiveAt"),
            token: resp.get_string("token"),
            quota: resp.get_string("m3c"),
            message: resp.get_string("msg"),
        }
    }
}

/// Exclusive-token usage reported by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExclusiveStatus {
    #[serde(rename = "exclusiveUsed")]
    pub used: i64,
    #[serde(rename = "exclusiveTotal")]
    pub total: i64,
    #[serde(rename = "exclusiveErr")]
    pub error: String,
    #[serde(rename = "exclusiveToken")]
    pub token: String,
}

/// Checkout link returned by one of the payment endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentOrder {
    pub pay_url: String,
    pub order_id: String,
}

const HEALTH_DEADLINE: Duration = Duration::from_secs(5);
const SHORT_DEADLINE: Duration = Duration::from_secs(10);
const LICENSE_DEADLINE: Duration = Duration::from_secs(15);
const ACCOUNT_DEADLINE: Duration = Duration::from_secs(20);

pub struct ControlClient {
    http: RetryingClient,
    identity: ClientIdentity,
    signer: Arc<dyn Signer>,
    metrics: ClientMetrics,
    health_path: String,
}

impl ControlClient {
    pub fn new(http: RetryingClient, identity: ClientIdentity, signer: Arc<dyn Signer>) -> Self {
        Self {
            http,
            identity,
            signer,
            metrics: ClientMetrics::default(),
            health_path: "/health".to_string(),
        }
    }

    /// Build the production client: hyper transport with env proxy and identity user agent
    pub fn from_config(
        config: &ControlConfig,
        identity: ClientIdentity,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        let transport = HyperTransport::from_config(config)?.with_user_agent(identity.user_agent());
        let http = RetryingClient::from_config(config, Arc::new(transport));

        let mut client = Self::new(http, identity, signer);
        client.health_path = config.check_path.clone();
        Ok(client)
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn http(&self) -> &RetryingClient {
        &self.http
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Explicitly re-check the configured hosts
    pub async fn select_host(&self) -> Option<String> {
        self.http.select_host().await
    }

    pub async fn health_check(&self) -> Result<()> {
        let request = ApiRequest::get(self.health_path.clone()).deadline(HEALTH_DEADLINE);
        self.call("health_check", request).await.map(|_| ())
    }

    /// Returns the update URL when a newer release is available
    pub async fn check_version(&self, version: &str) -> Result<Option<String>> {
        let (os, arch) = platform();
        let request = ApiRequest::get("/version")
            .query("version", version)
            .query("plat", format!("{}_{}", os, arch))
            .deadline(SHORT_DEADLINE);

        let resp = self.call("check_version", request).await?;
        let url = resp.get_string("url");
        Ok((!url.is_empty()).then_some(url))
    }

    pub async fn license(&self, mode: i64) -> Result<License> {
        let request = self
            .signed(ApiRequest::get("/getLic"), &self.identity.device_id)
            .query("mode", mode.to_string())
            .deadline(LICENSE_DEADLINE);

        let resp = self.call("license", request).await?;
        Ok(License {
            ok: resp.get_int("code") == 0,
            payload: resp.get_string("lic"),
        })
    }

    /// Account summary for `device_id`; a non-empty `error` field is surfaced as
    /// [`InterposeError::Remote`]
    pub async fn account_info(&self, device_id: &str) -> Result<AccountInfo> {
        let body = json!({
            "device": device_id,
            "sDevice": self.identity.promotion,
        });
        let request = self
            .signed(ApiRequest::post("/my"), device_id)
            .header("deviceName", self.identity.device_name.clone())
            .json(&body)?
            .deadline(ACCOUNT_DEADLINE);

        let resp = self.call("account_info", request).await?;
        let remote_error = resp.get_string("error");
        if !remote_error.is_empty() {
            warn!(error = %remote_error, "Control plane rejected account lookup");
            return Err(InterposeError::Remote(remote_error));
        }

        Ok(AccountInfo::from_response(&resp))
    }

    pub async fn delete_token(&self, device_id: &str, category: &str) -> Result<()> {
        let request = self
            .signed(ApiRequest::delete("/delFToken"), device_id)
            .query("category", category)
            .deadline(SHORT_DEADLINE);

        self.call("delete_token", request).await.map(|_| ())
    }

    pub async fn upload_checksum_prefix(&self, prefix: &str, device_id: &str) -> Result<()> {
        let request = self
            .signed(ApiRequest::post("/upChecksumPrefix"), device_id)
            .json(&json!({ "p": prefix }))?
            .deadline(SHORT_DEADLINE);

        self.call("upload_checksum_prefix", request).await.map(|_| ())
    }

    /// Whether the backend holds a token for `device_id`
    pub async fn check_token(&self, device_id: &str) -> Result<bool> {
        let request = self
            .signed(ApiRequest::get("/checkFToken"), device_id)
            .deadline(LICENSE_DEADLINE);

        Ok(self.call("check_token", request).await?.get_bool("has"))
    }

    pub async fn upload_exclusive_status(
        &self,
        status: &ExclusiveStatus,
        device_id: &str,
    ) -> Result<()> {
        let request = self
            .signed(ApiRequest::post("/upExclusiveStatus"), device_id)
            .json(status)?
            .deadline(LICENSE_DEADLINE);

        self.call("upload_exclusive_status", request).await.map(|_| ())
    }

    /// Request a checkout link from a payment endpoint such as `/payUrl`
    pub async fn payment_url(&self, endpoint: &str) -> Result<PaymentOrder> {
        let request = ApiRequest::get(endpoint).deadline(LICENSE_DEADLINE);

        let resp = self.call("payment_url", request).await?;
        Ok(PaymentOrder {
            pay_url: resp.get_string("payUrl"),
            order_id: resp.get_string("orderID"),
        })
    }

    /// Whether `order_id` has been paid, asked of a check endpoint such as `/payCheck`
    pub async fn payment_check(
        &self,
        endpoint: &str,
        order_id: &str,
        device_id: &str,
    ) -> Result<bool> {
        let request = self
            .signed(ApiRequest::get(endpoint), device_id)
            .query("orderID", order_id)
            .query("deviceID", device_id)
            .deadline(LICENSE_DEADLINE);

        Ok(self.call("payment_check", request).await?.get_bool("isPay"))
    }

    /// Free-form announcement text
    pub async fn announcement(&self) -> Result<String> {
        let request = ApiRequest::get("/ad").deadline(SHORT_DEADLINE);
        Ok(self.call("announcement", request).await?.text())
    }

    fn signed(&self, request: ApiRequest, device_id: &str) -> ApiRequest {
        if device_id.is_empty() {
            request
        } else {
            request.header("sign", self.signer.sign(device_id))
        }
    }

    async fn call(&self, operation: &'static str, request: ApiRequest) -> Result<ApiResponse> {
        let started = Instant::now();
        let result = self.http.request(request).await;
        self.metrics.record(started, result.is_ok());

        match &result {
            Ok(resp) => debug!(operation, status = %resp.status, "Control-plane call succeeded"),
            Err(e) => info!(operation, error = %e, "Control-plane call failed"),
        }
        result
    }
}
