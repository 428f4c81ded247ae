//! Retrying HTTP transport: the single chokepoint for every API call.
//!
//! # Data Flow
//! ```text
//! perform(request):
//!     → rate limiter   (reject: RateLimited, no retry, breaker untouched)
//!     → circuit breaker (reject: ServiceUnavailable, no network call)
//!     → backend.send with timeout
//!     → classify: 2xx ok | 409 conflict | 4xx client | 5xx/transport retry
//! ```

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

use lifetrack_common::{Error, HttpMethod, Result};

use crate::breaker::CircuitBreaker;
use crate::conflict::ConflictResolver;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Status code the backend uses for optimistic-concurrency conflicts.
pub const CONFLICT_STATUS: u16 = 409;

/// Header carrying the static API credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Longest slice of an error body kept in client-error messages.
const ERROR_BODY_LIMIT: usize = 256;

/// An API call, independent of the HTTP client used to send it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Stable identity of the logical operation; survives retries and
    /// offline-queue replays.
    pub operation_id: String,
    /// Human-readable label for logs and conflict banners.
    pub label: String,
    pub method: HttpMethod,
    /// Path relative to the base URL, starting with `/`.
    pub path: String,
    /// JSON-encoded request body.
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    /// Create a request with a fresh operation id.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            operation_id: Uuid::new_v4().to_string(),
            label: format!("{} {}", method, path),
            method,
            path,
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// Set the human-readable label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Reuse an existing operation id.
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = id.into();
        self
    }

    /// Attach a pre-encoded JSON body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Encode `body` as JSON and attach it.
    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(self.with_body(bytes))
    }

    /// Check the request can be sent at all.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "Request path must start with '/': {}",
                self.path
            )));
        }
        if self.path.contains("://") || self.path.chars().any(char::is_whitespace) {
            return Err(Error::InvalidInput(format!("Invalid request path: {}", self.path)));
        }
        Ok(())
    }
}

/// A raw response: status plus body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Decoding(format!("Unexpected response shape: {}", e)))
    }

    fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(ERROR_BODY_LIMIT).collect()
    }
}

/// Raw HTTP backend.
///
/// Implementations send exactly one request and report any failure to get
/// a response as [`Error::Transport`]. Every status code, including 4xx
/// and 5xx, is a successful send.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: &ApiRequest, timeout: Duration) -> Result<ApiResponse>;
}

/// [`HttpBackend`] over reqwest.
pub struct ReqwestBackend {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl ReqwestBackend {
    /// Create a backend for `base_url`, attaching `api_key` to every request.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base_url, e)))?;
        let http = Client::builder()
            .user_agent("Lifetrack/0.1")
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", joined, e)))
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: &ApiRequest, timeout: Duration) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;

        let mut builder = self
            .http
            .request(to_reqwest_method(request.method), url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout);

        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} failed: {}", request.label, e)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read response body: {}", e)))?;

        Ok(ApiResponse::new(status, body.to_vec()))
    }
}

/// Wraps an [`HttpBackend`] with rate limiting, the circuit breaker,
/// retry with backoff, and response classification.
pub struct RetryingTransport {
    backend: Arc<dyn HttpBackend>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    resolver: Arc<ConflictResolver>,
    executor: RetryExecutor,
    timeout: Duration,
}

impl RetryingTransport {
    /// Create a transport sharing the given breaker, limiter and resolver.
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        resolver: Arc<ConflictResolver>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            breaker,
            limiter,
            resolver,
            executor: RetryExecutor::new(policy),
            timeout,
        }
    }

    /// The breaker consulted before every attempt.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The conflict resolver fed by 409 responses.
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Send `request`, retrying transient failures.
    ///
    /// # Errors
    /// - `InvalidInput` for malformed requests (nothing is sent)
    /// - `RateLimited`, `ServiceUnavailable` without touching the network
    /// - `ServerUnavailable` once transport retries are exhausted
    /// - `ServerError(status)` once 5xx retries are exhausted
    /// - `Conflict` for 409, after handing the body to the resolver
    /// - `ClientError` for other 4xx, never retried
    pub async fn perform(&self, request: &ApiRequest) -> Result<ApiResponse> {
        request.validate()?;

        let result = self
            .executor
            .execute(|attempt| self.attempt(request, attempt))
            .await;

        match result {
            Err(Error::Transport(reason)) => {
                error!("{} unreachable after retries: {}", request.label, reason);
                Err(Error::ServerUnavailable)
            }
            other => other,
        }
    }

    /// Send `request` and decode the JSON response.
    pub async fn perform_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        self.perform(request).await?.json()
    }

    async fn attempt(&self, request: &ApiRequest, attempt: u32) -> Result<ApiResponse> {
        if !self.limiter.should_allow(&request.path, request.method).await {
            return Err(Error::RateLimited {
                endpoint: request.path.clone(),
                method: request.method,
            });
        }

        if !self.breaker.allow_request() {
            debug!("Circuit open, failing fast: {}", request.label);
            return Err(Error::ServiceUnavailable);
        }

        debug!("{} (attempt {})", request.label, attempt);
        let sent = tokio::time::timeout(self.timeout, self.backend.send(request, self.timeout)).await;

        match sent {
            Ok(Ok(response)) => self.classify(request, response),
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!("{} attempt {} failed: {}", request.label, attempt, e);
                Err(Error::Transport(e.to_string()))
            }
            Err(_) => {
                self.breaker.record_failure();
                warn!("{} attempt {} timed out after {:?}", request.label, attempt, self.timeout);
                Err(Error::Transport(format!("timed out after {:?}", self.timeout)))
            }
        }
    }

    fn classify(&self, request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse> {
        match response.status {
            200..=299 => {
                self.breaker.record_success();
                debug!("{} -> {}", request.label, response.status);
                Ok(response)
            }
            CONFLICT_STATUS => {
                warn!("{} rejected with conflict", request.label);
                self.spawn_conflict_resolution(request, response.body);
                Err(Error::Conflict(request.label.clone()))
            }
            status @ 500..=599 => {
                self.breaker.record_failure();
                Err(Error::ServerError(status))
            }
            status @ 400..=499 => {
                debug!("{} -> client error {}", request.label, status);
                Err(Error::ClientError {
                    status,
                    message: response.body_excerpt(),
                })
            }
            status => Err(Error::Decoding(format!(
                "Unexpected status {} for {}",
                status, request.label
            ))),
        }
    }

    fn spawn_conflict_resolution(&self, request: &ApiRequest, body: Vec<u8>) {
        let resolver = self.resolver.clone();
        let operation_id = request.operation_id.clone();
        let label = request.label.clone();
        let local_body = request.body.clone();

        tokio::spawn(async move {
            resolver.handle_conflict_response(&operation_id, &label, &body, local_body.as_deref());
        });
    }
}
