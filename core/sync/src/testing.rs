//! Scripted HTTP backend for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lifetrack_common::{Error, Result};
use lifetrack_storage::{KeyValueStore, MemoryStore};

use crate::breaker::CircuitBreaker;
use crate::conflict::{ConflictResolver, ConflictStrategy};
use crate::events::EventBus;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::RetryPolicy;
use crate::transport::{ApiRequest, ApiResponse, HttpBackend, RetryingTransport};

type Handler = Box<dyn Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync>;

/// Backend answering from a closure and recording every request.
///
/// The closure receives the request and how many earlier calls were made
/// to the same path.
pub struct ScriptedBackend {
    handler: Handler,
    latency: Duration,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, usize) -> Result<ApiResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with `status` and a JSON body.
    pub fn always(status: u16, body: Value) -> Self {
        let bytes = body.to_string().into_bytes();
        Self::new(move |_, _| Ok(ApiResponse::new(status, bytes.clone())))
    }

    /// Fail every request before a response arrives.
    pub fn offline() -> Self {
        Self::new(|_, _| Err(Error::Transport("connection refused".to_string())))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn send(&self, request: &ApiRequest, _timeout: Duration) -> Result<ApiResponse> {
        let previous = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = calls.iter().filter(|r| r.path == request.path).count();
            calls.push(request.clone());
            previous
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(request, previous)
    }
}

/// Retry policy with millisecond delays.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false)
}

/// Transport over `backend` with fast retries and a permissive limiter.
pub fn fast_transport(backend: Arc<ScriptedBackend>) -> (RetryingTransport, EventBus) {
    fast_transport_with(backend, CircuitBreaker::default())
}

/// Like [`fast_transport`], with a caller-supplied breaker.
pub fn fast_transport_with(
    backend: Arc<ScriptedBackend>,
    breaker: CircuitBreaker,
) -> (RetryingTransport, EventBus) {
    let events = EventBus::default();
    let transport = RetryingTransport::new(
        backend,
        Arc::new(breaker),
        Arc::new(RateLimiter::new(RateLimitConfig {
            burst: 10_000,
            refill_per_second: 10_000.0,
            ..RateLimitConfig::default()
        })),
        Arc::new(ConflictResolver::new(
            ConflictStrategy::ServerWins,
            events.clone(),
        )),
        fast_policy(),
        Duration::from_secs(5),
    );
    (transport, events)
}

/// Per-path toggles for building backends whose behavior changes mid-test.
#[derive(Clone, Default)]
pub struct Switchboard {
    statuses: Arc<Mutex<HashMap<String, u16>>>,
}

impl Switchboard {
    pub fn set(&self, path: &str, status: u16) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), status);
    }

    pub fn status_for(&self, path: &str) -> Option<u16> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    /// Backend answering each path with its current status; unknown paths
    /// are unreachable.
    pub fn backend(&self, body: Value) -> ScriptedBackend {
        let board = self.clone();
        let bytes = body.to_string().into_bytes();
        ScriptedBackend::new(move |request, _| match board.status_for(&request.path) {
            Some(status) => Ok(ApiResponse::new(status, bytes.clone())),
            None => Err(Error::Transport("connection refused".to_string())),
        })
    }
}

/// Memory store whose writes can be switched to fail.
#[derive(Clone)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }
}
