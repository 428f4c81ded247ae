//! Durable offline queue for writes the backend has not confirmed.
//!
//! Operations are persisted under a single store key and replayed through
//! the [`RetryingTransport`], so replays respect the rate limiter and the
//! circuit breaker like any other call. Operations sharing a resource key
//! replay strictly in enqueue order; different resources replay
//! concurrently.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use lifetrack_common::{Error, HttpMethod, OperationKind, Result};
use lifetrack_storage::{load_json, save_json, KeyValueStore};

use crate::events::{EventBus, SyncEvent};
use crate::transport::{ApiRequest, RetryingTransport};

/// Store key holding the queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    PermanentlyFailed,
}

/// A write waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Operation id; also used as the request's operation id on replay.
    pub id: String,
    pub description: String,
    pub kind: OperationKind,
    pub method: HttpMethod,
    pub endpoint: String,
    /// Scope within which replay order is preserved.
    pub resource_key: String,
    /// Serialized JSON body.
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    /// Capture `request` for later replay.
    ///
    /// The resource key defaults to the request path, so edits to the same
    /// record stay ordered. Bodies must be UTF-8 (they are stored as JSON
    /// text), anything else is rejected rather than altered.
    pub fn from_request(
        kind: OperationKind,
        description: impl Into<String>,
        request: &ApiRequest,
    ) -> Result<Self> {
        let payload = match &request.body {
            Some(body) => Some(String::from_utf8(body.clone()).map_err(|_| {
                Error::InvalidInput(format!(
                    "Cannot queue {}: body is not UTF-8",
                    request.label
                ))
            })?),
            None => None,
        };

        Ok(Self {
            id: request.operation_id.clone(),
            description: description.into(),
            kind,
            method: request.method,
            endpoint: request.path.clone(),
            resource_key: request.path.clone(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            status: QueueStatus::Pending,
            failed_at: None,
        })
    }

    /// Override the ordering scope.
    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = key.into();
        self
    }

    /// Rebuild the request to replay.
    pub fn to_request(&self) -> ApiRequest {
        let request = ApiRequest::new(self.method, self.endpoint.clone())
            .with_operation_id(self.id.clone())
            .with_label(self.description.clone());
        match &self.payload {
            Some(payload) => request.with_body(payload.clone().into_bytes()),
            None => request,
        }
    }

    fn fail_permanently(&mut self, error: &Error) {
        self.status = QueueStatus::PermanentlyFailed;
        self.last_error = Some(error.to_string());
        self.failed_at = Some(Utc::now());
    }
}

/// A permanently failed operation awaiting user action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntry {
    pub id: String,
    pub kind: OperationKind,
    pub description: String,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<&QueuedOperation> for FailedEntry {
    fn from(op: &QueuedOperation) -> Self {
        Self {
            id: op.id.clone(),
            kind: op.kind.clone(),
            description: op.description.clone(),
            failed_at: op.failed_at.unwrap_or(op.created_at),
            last_error: op.last_error.clone(),
        }
    }
}

/// Queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Counted failures before an operation is permanently failed.
    pub max_retries: u32,
    /// Interval between background processing passes.
    pub process_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            process_interval: Duration::from_secs(60),
        }
    }
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub attempted: usize,
    pub delivered: usize,
    pub deferred: usize,
    pub failed_permanently: usize,
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    pending: Vec<QueuedOperation>,
    failed: Vec<QueuedOperation>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.pending.iter().chain(&self.failed).any(|op| op.id == id)
    }
}

/// How a single replay ended.
#[derive(Debug)]
enum ReplayOutcome {
    /// Confirmed by the server.
    Delivered,
    /// Rejected with 409; the conflict resolver owns the result.
    Conflicted,
    /// Failed in a way that consumes retry budget.
    Failed(Error),
    /// Not attempted on the network (breaker open, rate limited).
    Blocked(Error),
    /// Will never succeed as-is.
    Rejected(Error),
}

impl ReplayOutcome {
    fn classify(result: Result<()>) -> Self {
        match result {
            Ok(()) => ReplayOutcome::Delivered,
            Err(Error::Conflict(_)) => ReplayOutcome::Conflicted,
            Err(e @ (Error::ServiceUnavailable | Error::RateLimited { .. })) => {
                ReplayOutcome::Blocked(e)
            }
            Err(e) if e.is_permanent() => ReplayOutcome::Rejected(e),
            Err(e) => ReplayOutcome::Failed(e),
        }
    }

    /// Whether later operations on the same resource may proceed.
    fn unblocks_successors(&self) -> bool {
        matches!(
            self,
            ReplayOutcome::Delivered | ReplayOutcome::Conflicted | ReplayOutcome::Rejected(_)
        )
    }
}

/// Durable queue of deferred writes.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<RetryingTransport>,
    events: EventBus,
    config: QueueConfig,
    state: Mutex<QueueState>,
    processing: Mutex<()>,
}

impl OfflineQueue {
    /// Open the queue, restoring any persisted operations.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<RetryingTransport>,
        events: EventBus,
        config: QueueConfig,
    ) -> Result<Self> {
        let state: QueueState = load_json(store.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();

        if !state.pending.is_empty() || !state.failed.is_empty() {
            info!(
                "Restored offline queue: {} pending, {} failed",
                state.pending.len(),
                state.failed.len()
            );
        }

        Ok(Self {
            store,
            transport,
            events,
            config,
            state: Mutex::new(state),
            processing: Mutex::new(()),
        })
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist `next`, then make it the live state.
    ///
    /// On a failed write the live state is left as it was, so memory never
    /// runs ahead of the store.
    async fn commit(&self, state: &mut QueueState, next: QueueState) -> Result<()> {
        save_json(self.store.as_ref(), QUEUE_KEY, &next).await?;
        *state = next;
        Ok(())
    }

    /// Persist an operation for later delivery.
    ///
    /// Enqueueing an id the queue already holds, pending or failed, is a
    /// no-op.
    pub async fn enqueue(&self, mut operation: QueuedOperation) -> Result<String> {
        let id = operation.id.clone();
        let mut state = self.state.lock().await;

        if state.contains(&id) {
            debug!("Operation {} already queued", id);
            return Ok(id);
        }

        operation.status = QueueStatus::Pending;
        operation.failed_at = None;
        let description = operation.description.clone();
        let mut next = state.clone();
        next.pending.push(operation);

        if let Err(e) = self.commit(&mut state, next).await {
            error!("Failed to persist queued operation {}: {}", id, e);
            return Err(e);
        }
        drop(state);

        info!("Queued offline operation {}: {}", id, description);
        self.events.publish(SyncEvent::OfflineItemQueued {
            id: id.clone(),
            description,
        });
        Ok(id)
    }

    /// Replay every pending operation once.
    ///
    /// Only one pass runs at a time; a call made while another pass is in
    /// progress returns immediately with `skipped` set.
    ///
    /// # Errors
    /// Returns the store error if the pass could not be persisted. The queue
    /// is then left as it was before the pass, so delivered operations stay
    /// pending and are replayed (with the same operation id) next time.
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        let Ok(_guard) = self.processing.try_lock() else {
            debug!("Queue processing already in progress");
            return Ok(ProcessReport {
                skipped: true,
                ..ProcessReport::default()
            });
        };

        let pending = self.state.lock().await.pending.clone();
        if pending.is_empty() {
            return Ok(ProcessReport::default());
        }

        info!("Processing {} queued operations", pending.len());
        let groups = group_by_resource(pending);
        let outcomes: Vec<(String, ReplayOutcome)> =
            join_all(groups.into_iter().map(|group| self.replay_group(group)))
                .await
                .into_iter()
                .flatten()
                .collect();

        self.apply_outcomes(outcomes).await
    }

    async fn replay_group(&self, group: Vec<QueuedOperation>) -> Vec<(String, ReplayOutcome)> {
        let mut outcomes = Vec::with_capacity(group.len());

        for operation in group {
            let request = operation.to_request();
            let result = self.transport.perform(&request).await.map(|_| ());
            let outcome = ReplayOutcome::classify(result);
            let proceed = outcome.unblocks_successors();
            outcomes.push((operation.id, outcome));

            if !proceed {
                break;
            }
        }

        outcomes
    }

    async fn apply_outcomes(
        &self,
        outcomes: Vec<(String, ReplayOutcome)>,
    ) -> Result<ProcessReport> {
        let mut report = ProcessReport {
            attempted: outcomes.len(),
            ..ProcessReport::default()
        };
        let mut newly_failed = Vec::new();
        let mut state = self.state.lock().await;
        let mut next = state.clone();

        for (id, outcome) in outcomes {
            let Some(index) = next.pending.iter().position(|op| op.id == id) else {
                continue;
            };

            match outcome {
                ReplayOutcome::Delivered | ReplayOutcome::Conflicted => {
                    let op = next.pending.remove(index);
                    debug!("Delivered queued operation {}", op.id);
                    report.delivered += 1;
                }
                ReplayOutcome::Blocked(e) => {
                    next.pending[index].last_error = Some(e.to_string());
                    report.deferred += 1;
                }
                ReplayOutcome::Failed(e) => {
                    let max_retries = self.config.max_retries;
                    let op = &mut next.pending[index];
                    op.retry_count += 1;
                    op.last_error = Some(e.to_string());

                    if op.retry_count >= max_retries {
                        let mut op = next.pending.remove(index);
                        op.fail_permanently(&e);
                        newly_failed.push(op);
                    } else {
                        warn!(
                            "Queued operation {} failed (attempt {}/{}): {}",
                            id, next.pending[index].retry_count, max_retries, e
                        );
                        report.deferred += 1;
                    }
                }
                ReplayOutcome::Rejected(e) => {
                    let mut op = next.pending.remove(index);
                    op.fail_permanently(&e);
                    newly_failed.push(op);
                }
            }
        }

        report.failed_permanently = newly_failed.len();
        next.failed.extend(newly_failed.iter().cloned());

        if let Err(e) = self.commit(&mut state, next).await {
            error!(
                "Failed to persist offline queue after processing, {} operations stay pending: {}",
                state.pending.len(),
                e
            );
            return Err(e);
        }
        drop(state);

        for op in newly_failed {
            let last_error = op.last_error.clone().unwrap_or_default();
            error!(
                "Queued operation {} permanently failed: {}",
                op.description, last_error
            );
            self.events.publish(SyncEvent::OfflineItemPermanentlyFailed {
                id: op.id,
                description: op.description,
                last_error,
            });
        }

        info!(
            "Queue pass complete: {} delivered, {} deferred, {} failed",
            report.delivered, report.deferred, report.failed_permanently
        );
        Ok(report)
    }

    /// Number of operations awaiting delivery.
    pub async fn get_queue_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Snapshot of pending operations in enqueue order.
    pub async fn pending_items(&self) -> Vec<QueuedOperation> {
        self.state.lock().await.pending.clone()
    }

    /// Operations that need user action.
    pub async fn get_failed_items(&self) -> Vec<FailedEntry> {
        self.state
            .lock()
            .await
            .failed
            .iter()
            .map(FailedEntry::from)
            .collect()
    }

    /// Move a failed operation back to pending with a fresh retry budget.
    ///
    /// Returns `false` if no failed operation has this id. If the id is
    /// already pending, the failed copy is dropped instead of duplicated.
    pub async fn retry_failed_item(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(index) = state.failed.iter().position(|op| op.id == id) else {
            return Ok(false);
        };

        let mut next = state.clone();
        let mut op = next.failed.remove(index);
        if next.pending.iter().any(|pending| pending.id == id) {
            warn!("Operation {} is already pending, dropping its failed copy", id);
        } else {
            op.status = QueueStatus::Pending;
            op.retry_count = 0;
            op.failed_at = None;
            next.pending.push(op);
        }
        self.commit(&mut state, next).await?;

        info!("Re-queued failed operation {}", id);
        Ok(true)
    }

    /// Drop a failed operation for good.
    ///
    /// Returns `false` if no failed operation has this id.
    pub async fn discard_failed_item(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.failed.iter().any(|op| op.id == id) {
            return Ok(false);
        }

        let mut next = state.clone();
        next.failed.retain(|op| op.id != id);
        self.commit(&mut state, next).await?;

        info!("Discarded failed operation {}", id);
        Ok(true)
    }

    /// Drop every failed operation; returns how many were removed.
    pub async fn clear_failed_items(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let removed = state.failed.len();
        if removed > 0 {
            let next = QueueState {
                pending: state.pending.clone(),
                failed: Vec::new(),
            };
            self.commit(&mut state, next).await?;
        }
        Ok(removed)
    }
}

/// Split operations into per-resource groups, keeping enqueue order both
/// within each group and across first appearances.
fn group_by_resource(operations: Vec<QueuedOperation>) -> Vec<Vec<QueuedOperation>> {
    let mut keys: Vec<String> = Vec::new();
    let mut groups: Vec<Vec<QueuedOperation>> = Vec::new();

    for op in operations {
        match keys.iter().position(|k| *k == op.resource_key) {
            Some(index) => groups[index].push(op),
            None => {
                keys.push(op.resource_key.clone());
                groups.push(vec![op]);
            }
        }
    }

    groups
}
