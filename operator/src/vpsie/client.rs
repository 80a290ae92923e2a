use async_trait::async_trait;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{
    auth::{Credentials, HttpTokenExchange, TokenManager},
    types::{CreateVmRequest, Datacenter, Offering, OsImage, Vm},
    ApiRateLimiter, CircuitBreaker, VpsieError,
};
use crate::util::clock::Clock;

/// Capability interface over the VPSie cloud. The controllers and the
/// cost calculator depend on this seam, never on the HTTP client
/// directly, so tests can run against a fake fleet.
#[async_trait]
pub trait VpsieApi: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<Vm>, VpsieError>;
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm, VpsieError>;
    async fn get_vm(&self, id: &str) -> Result<Vm, VpsieError>;
    async fn delete_vm(&self, id: &str) -> Result<(), VpsieError>;
    async fn list_offerings(&self) -> Result<Vec<Offering>, VpsieError>;
    async fn list_datacenters(&self) -> Result<Vec<Datacenter>, VpsieError>;
    async fn list_images(&self) -> Result<Vec<OsImage>, VpsieError>;

    /// Releases idle connections and flushes any buffered telemetry.
    async fn close(&self) {}
}

/// Tunables for the HTTP client.
#[derive(Clone, Debug)]
pub struct VpsieClientConfig {
    /// Per-request deadline.
    pub request_timeout: Duration,

    /// Cap on requests per minute towards the provider.
    pub rate_limit_rpm: u32,

    /// Consecutive failures before the circuit opens.
    pub breaker_threshold: u32,

    /// How long the circuit stays open before admitting a probe.
    pub breaker_cooldown: Duration,
}

impl Default for VpsieClientConfig {
    fn default() -> Self {
        VpsieClientConfig {
            request_timeout: Duration::from_secs(30),
            rate_limit_rpm: 120,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Request counters and latencies for the cloud client.
#[derive(Clone)]
pub struct ApiMetrics {
    pub requests: CounterVec,
    pub latency: HistogramVec,
    pub token_refreshes: IntCounter,
}

impl ApiMetrics {
    pub fn new(registry: &Registry) -> Self {
        let requests = CounterVec::new(
            Opts::new(
                "cloud_api_requests_total",
                "Number of requests sent to the VPSie API, by operation and outcome.",
            ),
            &["operation", "result"],
        )
        .unwrap();
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "cloud_api_request_duration_seconds",
                "Latency of VPSie API requests.",
            ),
            &["operation"],
        )
        .unwrap();
        let token_refreshes = IntCounter::new(
            "cloud_api_token_refresh_total",
            "Number of OAuth token exchanges performed.",
        )
        .unwrap();
        registry.register(Box::new(requests.clone())).unwrap();
        registry.register(Box::new(latency.clone())).unwrap();
        registry.register(Box::new(token_refreshes.clone())).unwrap();
        ApiMetrics {
            requests,
            latency,
            token_refreshes,
        }
    }
}

/// Authenticated HTTP client for the VPSie API. Each request passes
/// through, in order: the rate limiter, token freshness, the circuit
/// gate, execution, a single refresh-and-retry on 401, classification
/// into the error taxonomy, and metrics recording.
pub struct VpsieClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    limiter: ApiRateLimiter,
    breaker: CircuitBreaker,
    metrics: ApiMetrics,
}

impl VpsieClient {
    pub fn new(
        config: &VpsieClientConfig,
        credentials: Credentials,
        clock: Arc<dyn Clock>,
        registry: &Registry,
    ) -> Result<Self, VpsieError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| VpsieError::Network(e.to_string()))?;
        let metrics = ApiMetrics::new(registry);
        let base_url = credentials.url.clone();
        let tokens = Arc::new(TokenManager::new(
            Arc::new(HttpTokenExchange::new(http.clone())),
            credentials,
            clock.clone(),
            metrics.token_refreshes.clone(),
        ));
        Ok(VpsieClient {
            http,
            base_url,
            tokens,
            limiter: ApiRateLimiter::new(config.rate_limit_rpm),
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                config.breaker_cooldown,
                clock,
            ),
            metrics,
        })
    }

    /// Swaps in rotated credentials for subsequent token exchanges.
    pub fn rotate_credentials(&self, credentials: Credentials) {
        self.tokens.rotate_credentials(credentials);
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, VpsieError> {
        let response = self.dispatch(operation, method, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| VpsieError::Network(format!("decoding {} response: {}", operation, e)))
    }

    async fn request_no_content(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
    ) -> Result<(), VpsieError> {
        self.dispatch(operation, method, path, None).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, VpsieError> {
        self.limiter.acquire().await;
        let token = self.tokens.bearer().await?;
        match self
            .attempt(operation, method.clone(), path, body, &token)
            .await
        {
            // Refresh exactly once on a 401 and replay the request.
            Err(VpsieError::Unauthorized) => {
                let token = self.tokens.refresh_after_unauthorized(&token).await?;
                self.attempt(operation, method, path, body, &token).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, VpsieError> {
        self.breaker.try_acquire()?;
        let timer = self
            .metrics
            .latency
            .with_label_values(&[operation])
            .start_timer();
        let result = self.send(method, path, body, token).await;
        timer.observe_duration();
        match &result {
            Ok(_) => {
                self.breaker.record_success();
                self.metrics
                    .requests
                    .with_label_values(&[operation, "ok"])
                    .inc();
            }
            Err(err) => {
                // Only service-health failures feed the breaker; a 404
                // or 403 is a perfectly healthy answer.
                match err {
                    VpsieError::ServerError { .. }
                    | VpsieError::Network(_)
                    | VpsieError::Timeout => self.breaker.record_failure(),
                    VpsieError::CircuitOpen => {}
                    _ => self.breaker.record_success(),
                }
                self.metrics
                    .requests
                    .with_label_values(&[operation, err.kind()])
                    .inc();
            }
        }
        result
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response, VpsieError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VpsieError::from_status(status.as_u16(), message));
        }
        Ok(response)
    }
}

#[async_trait]
impl VpsieApi for VpsieClient {
    async fn list_vms(&self) -> Result<Vec<Vm>, VpsieError> {
        self.request("list_vms", Method::GET, "/api/v1/vms", None)
            .await
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm, VpsieError> {
        let body = serde_json::to_value(request)
            .map_err(|e| VpsieError::Network(format!("encoding create request: {}", e)))?;
        self.request("create_vm", Method::POST, "/api/v1/vms", Some(&body))
            .await
    }

    async fn get_vm(&self, id: &str) -> Result<Vm, VpsieError> {
        self.request("get_vm", Method::GET, &format!("/api/v1/vms/{}", id), None)
            .await
    }

    async fn delete_vm(&self, id: &str) -> Result<(), VpsieError> {
        self.request_no_content("delete_vm", Method::DELETE, &format!("/api/v1/vms/{}", id))
            .await
    }

    async fn list_offerings(&self) -> Result<Vec<Offering>, VpsieError> {
        self.request("list_offerings", Method::GET, "/api/v1/offerings", None)
            .await
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>, VpsieError> {
        self.request("list_datacenters", Method::GET, "/api/v1/datacenters", None)
            .await
    }

    async fn list_images(&self) -> Result<Vec<OsImage>, VpsieError> {
        self.request("list_images", Method::GET, "/api/v1/images", None)
            .await
    }

    async fn close(&self) {
        tracing::debug!("closing VPSie client");
    }
}
