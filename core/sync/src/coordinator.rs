//! Sync coordinator: per-domain read syncs, cache fallback and write
//! submission.
//!
//! # Data Flow
//! ```text
//! sync(domain):
//!     in flight? → join the running attempt
//!     else       → mark syncing → GET endpoint through the transport
//!                  ok:   replace cached model, record success
//!                  err:  serve cached model if any, record last error
//!                  → publish snapshot + DomainSynced event
//!
//! submit_write(op):
//!     transport ok            → Confirmed
//!     backend unavailable     → offline queue → Queued(id)
//!     anything else           → error to the caller
//! ```

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use lifetrack_common::{Domain, Error, ErrorKind, OperationKind, Result};
use lifetrack_storage::KeyValueStore;

use crate::breaker::{BreakerDiagnostics, CircuitBreaker};
use crate::cache::{CachedReadModel, ReadModelCache};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::events::{EventBus, SyncEvent};
use crate::queue::{OfflineQueue, QueuedOperation};
use crate::rate_limit::RateLimiter;
use crate::state::{DomainState, Staleness, SyncSnapshot};
use crate::transport::{ApiRequest, ApiResponse, HttpBackend, ReqwestBackend, RetryingTransport};

/// Result of one domain sync attempt.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Fresh data from the backend.
    Fresh(Arc<CachedReadModel>),
    /// The backend failed; the last confirmed model is served instead.
    FromCache {
        model: Arc<CachedReadModel>,
        error: String,
    },
    /// The backend failed and nothing is cached.
    Failed { error: String },
}

impl SyncOutcome {
    /// The model to show, if any.
    pub fn model(&self) -> Option<&Arc<CachedReadModel>> {
        match self {
            SyncOutcome::Fresh(model) | SyncOutcome::FromCache { model, .. } => Some(model),
            SyncOutcome::Failed { .. } => None,
        }
    }

    /// The error of a failed attempt.
    pub fn error(&self) -> Option<&str> {
        match self {
            SyncOutcome::Fresh(_) => None,
            SyncOutcome::FromCache { error, .. } | SyncOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, SyncOutcome::Fresh(_))
    }
}

/// Result of submitting a write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The backend confirmed the write.
    Confirmed(ApiResponse),
    /// The backend was unavailable; the write was saved for later delivery.
    Queued(String),
}

type InFlight = Shared<BoxFuture<'static, SyncOutcome>>;

struct Inner {
    config: SyncConfig,
    transport: Arc<RetryingTransport>,
    cache: ReadModelCache,
    queue: Arc<OfflineQueue>,
    events: EventBus,
    state_tx: watch::Sender<SyncSnapshot>,
    in_flight: Mutex<HashMap<Domain, InFlight>>,
    syncing_all: AtomicUsize,
}

/// Coordinates domain syncs and owns the shared engine components.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Build the engine over `backend`, restoring cache and queue from
    /// `store`.
    pub async fn new(
        config: SyncConfig,
        backend: Arc<dyn HttpBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let resolver = ConflictResolver::new(config.conflict_strategy, events.clone())
            .with_client_owned_fields(config.client_owned_fields.clone());
        let transport = Arc::new(RetryingTransport::new(
            backend,
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            Arc::new(resolver),
            config.retry.clone(),
            config.request_timeout,
        ));

        let cache = ReadModelCache::restore(store.clone()).await?;
        let queue = Arc::new(
            OfflineQueue::open(store, transport.clone(), events.clone(), config.queue.clone())
                .await?,
        );

        let (state_tx, _) = watch::channel(initial_snapshot(&cache, &config));

        info!("Sync coordinator ready for {}", config.base_url);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                cache,
                queue,
                events,
                state_tx,
                in_flight: Mutex::new(HashMap::new()),
                syncing_all: AtomicUsize::new(0),
            }),
        })
    }

    /// Build the engine talking HTTP to `config.base_url`.
    pub async fn connect(config: SyncConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let backend = ReqwestBackend::new(&config.base_url, config.api_key.clone())?;
        Self::new(config, Arc::new(backend), store).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.inner.queue
    }

    /// The transport every call goes through.
    pub fn transport(&self) -> &Arc<RetryingTransport> {
        &self.inner.transport
    }

    /// Subscribe to outward-facing events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to state snapshots.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.state_tx.subscribe()
    }

    /// Current state of every domain.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.state_tx.borrow().clone()
    }

    /// Current state of one domain.
    pub fn domain_state(&self, domain: Domain) -> DomainState {
        self.inner.state_tx.borrow().domain(domain)
    }

    /// Last confirmed model for `domain`.
    pub fn read_model(&self, domain: Domain) -> Option<Arc<CachedReadModel>> {
        self.inner.cache.get(domain)
    }

    pub fn breaker_diagnostics(&self) -> BreakerDiagnostics {
        self.inner.transport.breaker().diagnostics()
    }

    /// Sync one domain.
    ///
    /// If a sync of `domain` is already running, this waits for it and
    /// returns its outcome instead of starting another request.
    pub async fn sync(&self, domain: Domain) -> SyncOutcome {
        let attempt = {
            let mut in_flight = self.inner.lock_in_flight();
            match in_flight.get(&domain) {
                Some(running) => {
                    debug!("Joining in-flight sync of {}", domain);
                    running.clone()
                }
                None => {
                    self.inner
                        .state_tx
                        .send_modify(|snapshot| snapshot.domains.entry(domain).or_default().begin());

                    let inner = self.inner.clone();
                    let handle = tokio::spawn(async move { inner.run_sync(domain).await });
                    let attempt = async move {
                        handle.await.unwrap_or_else(|e| SyncOutcome::Failed {
                            error: format!("sync task failed: {}", e),
                        })
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(domain, attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Sync every domain with bounded parallelism.
    ///
    /// Domains whose data is still fresh are skipped unless `force` is set.
    /// A failing domain never affects the others; each outcome is recorded
    /// in its own state.
    pub async fn sync_all(&self, force: bool) -> Vec<(Domain, SyncOutcome)> {
        let _guard = SyncAllGuard::enter(self.inner.clone());

        let now = Utc::now();
        let snapshot = self.snapshot();
        let domains: Vec<Domain> = Domain::ALL
            .into_iter()
            .filter(|domain| {
                force
                    || self
                        .inner
                        .config
                        .staleness
                        .classify(snapshot.domain(*domain).last_success, now)
                        != Staleness::Fresh
            })
            .collect();

        if domains.len() < Domain::ALL.len() {
            debug!(
                "Skipping {} fresh domains",
                Domain::ALL.len() - domains.len()
            );
        }

        let outcomes: Vec<(Domain, SyncOutcome)> = stream::iter(domains)
            .map(|domain| async move { (domain, self.sync(domain).await) })
            .buffer_unordered(self.inner.config.max_concurrent_syncs.max(1))
            .collect()
            .await;

        let failed = outcomes.iter().filter(|(_, o)| !o.is_fresh()).count();
        info!(
            "Sync-all finished: {} synced, {} failed",
            outcomes.len() - failed,
            failed
        );
        outcomes
    }

    /// Run [`sync_all`](Self::sync_all) but wait at most `timeout`.
    ///
    /// Domain syncs still running when the timeout elapses keep going in
    /// the background; the returned snapshot reflects whatever has settled.
    pub async fn sync_all_bounded(&self, force: bool, timeout: Duration) -> SyncSnapshot {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.sync_all(force).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Sync-all task failed: {}", e),
            Err(_) => warn!(
                "Sync-all still running after {:?}, continuing with current data",
                timeout
            ),
        }
        self.snapshot()
    }

    /// Recompute every domain's staleness against the current time.
    pub fn refresh_staleness(&self) {
        let now = Utc::now();
        let thresholds = &self.inner.config.staleness;
        self.inner.state_tx.send_modify(|snapshot| {
            for state in snapshot.domains.values_mut() {
                state.refresh(now, thresholds);
            }
        });
    }

    /// Send a write, deferring it to the offline queue if the backend is
    /// unavailable.
    ///
    /// # Errors
    /// Client errors, conflicts, rate limiting and validation failures are
    /// returned as-is; the write is not queued.
    pub async fn submit_write(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
        request: ApiRequest,
    ) -> Result<WriteOutcome> {
        if !request.method.is_write() {
            return Err(Error::InvalidInput(format!(
                "{} is not a write",
                request.label
            )));
        }

        let description = description.into();
        match self.inner.transport.perform(&request).await {
            Ok(response) => Ok(WriteOutcome::Confirmed(response)),
            Err(e) if e.is_unavailable() => {
                info!("{} deferred, backend unavailable: {}", description, e);
                let operation = QueuedOperation::from_request(kind, description, &request)?;
                let id = self.inner.queue.enqueue(operation).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Domain, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_sync(self: Arc<Self>, domain: Domain) -> SyncOutcome {
        info!("Syncing {}", domain);
        let request = ApiRequest::get(self.config.endpoint_for(domain))
            .with_label(format!("Sync {}", domain));

        let (outcome, error_kind) = match self.transport.perform_json::<Value>(&request).await {
            Ok(payload) => {
                let model = self
                    .cache
                    .replace(CachedReadModel::new(domain, payload))
                    .await;
                (SyncOutcome::Fresh(model), None)
            }
            Err(e) => {
                let error = e.to_string();
                let outcome = match self.cache.get(domain) {
                    Some(model) => {
                        warn!("{} sync failed, serving cached data: {}", domain, error);
                        SyncOutcome::FromCache { model, error }
                    }
                    None => {
                        error!("{} sync failed with no cached data: {}", domain, error);
                        SyncOutcome::Failed { error }
                    }
                };
                (outcome, Some(e.kind()))
            }
        };

        self.finish(domain, &outcome, error_kind);
        self.events.publish(SyncEvent::DomainSynced {
            domain,
            from_cache: matches!(outcome, SyncOutcome::FromCache { .. }),
            error: outcome.error().map(str::to_string),
        });
        outcome
    }

    /// Record the outcome and release the in-flight slot.
    ///
    /// Both happen under the in-flight lock so a new attempt cannot start
    /// between them. Failures are recorded by their [`ErrorKind`] slug.
    fn finish(&self, domain: Domain, outcome: &SyncOutcome, error_kind: Option<ErrorKind>) {
        let now = Utc::now();
        let thresholds = &self.config.staleness;
        let recorded = |error: &String| {
            error_kind.map_or_else(|| error.clone(), |kind| kind.as_str().to_string())
        };
        let mut in_flight = self.lock_in_flight();

        self.state_tx.send_modify(|snapshot| {
            let state = snapshot.domains.entry(domain).or_default();
            match outcome {
                SyncOutcome::Fresh(model) => state.succeed(model.updated_at, thresholds),
                SyncOutcome::FromCache { error, .. } => {
                    state.fail(recorded(error), true, now, thresholds)
                }
                SyncOutcome::Failed { error } => {
                    state.fail(recorded(error), false, now, thresholds)
                }
            }
        });

        in_flight.remove(&domain);
    }
}

/// Keeps `is_syncing_all` set while at least one sync-all is running.
struct SyncAllGuard {
    inner: Arc<Inner>,
}

impl SyncAllGuard {
    fn enter(inner: Arc<Inner>) -> Self {
        if inner.syncing_all.fetch_add(1, Ordering::SeqCst) == 0 {
            inner
                .state_tx
                .send_modify(|snapshot| snapshot.is_syncing_all = true);
        }
        Self { inner }
    }
}

impl Drop for SyncAllGuard {
    fn drop(&mut self) {
        if self.inner.syncing_all.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner
                .state_tx
                .send_modify(|snapshot| snapshot.is_syncing_all = false);
        }
    }
}

/// Initial snapshot; domains with a restored model start out serving it.
fn initial_snapshot(cache: &ReadModelCache, config: &SyncConfig) -> SyncSnapshot {
    let now = Utc::now();
    let mut snapshot = SyncSnapshot::initial();

    for domain in cache.domains() {
        if let Some(model) = cache.get(domain) {
            let state = snapshot.domains.entry(domain).or_default();
            state.last_success = Some(model.updated_at);
            state.is_from_cache = true;
            state.detail = Some("Showing saved data".to_string());
            state.refresh(now, &config.staleness);
        }
    }
    snapshot
}
