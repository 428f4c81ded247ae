//! Lifetrack Sync Engine
//!
//! This crate keeps the app's data usable while the backend is slow,
//! flaky or unreachable:
//! - Retrying HTTP transport with backoff, jitter and per-attempt timeout
//! - Process-wide circuit breaker and per-endpoint rate limiting
//! - Optimistic-conflict (409) resolution with outward events
//! - Durable offline queue for unconfirmed writes
//! - Per-domain sync with cached read-models and staleness tracking

pub mod breaker;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod events;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use breaker::{BreakerConfig, BreakerDiagnostics, CircuitBreaker, CircuitState};
pub use cache::{CachedReadModel, ReadModelCache};
pub use config::SyncConfig;
pub use conflict::{ConflictResolver, ConflictStrategy, ResolutionKind, ResolutionSummary};
pub use coordinator::{SyncCoordinator, SyncOutcome, WriteOutcome};
pub use events::{EventBus, SyncEvent};
pub use queue::{FailedEntry, OfflineQueue, ProcessReport, QueueConfig, QueueStatus, QueuedOperation};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{ConnectivityHandle, QueueScheduler, QueueSchedulerHandle};
pub use state::{DomainState, Staleness, StalenessThresholds, SyncSnapshot};
pub use transport::{ApiRequest, ApiResponse, HttpBackend, ReqwestBackend, RetryingTransport};
