//! Optimistic-conflict (409) reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::events::{EventBus, SyncEvent};

/// Number of resolved operations remembered for deduplication.
const HANDLED_CAPACITY: usize = 256;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The server's state replaces the local one.
    ServerWins,
    /// The server's state, with client-owned fields taken from the local write.
    MergeFields,
}

/// How a conflict ended up being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    ServerWins,
    Merged,
}

impl ResolutionKind {
    /// Human-readable description for banners.
    pub fn describe(&self) -> &'static str {
        match self {
            ResolutionKind::ServerWins => "Kept the server version",
            ResolutionKind::Merged => "Merged your changes with the server version",
        }
    }
}

/// Outcome of handling one conflict response.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionSummary {
    pub operation_id: String,
    pub operation_label: String,
    pub message: String,
    pub kind: ResolutionKind,
    /// The state the client should adopt, if the server supplied one.
    pub resolved_state: Option<Value>,
    pub server_version: Option<i64>,
    pub resolved_at: DateTime<Utc>,
}

/// Body the backend sends with a 409.
#[derive(Debug, Default, Deserialize)]
struct ConflictBody {
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default, alias = "current")]
    server_state: Option<Value>,
    #[serde(default)]
    version: Option<i64>,
}

#[derive(Default)]
struct Handled {
    order: VecDeque<String>,
    summaries: HashMap<String, ResolutionSummary>,
}

impl Handled {
    fn remember(&mut self, summary: ResolutionSummary) {
        if self.order.len() >= HANDLED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.summaries.remove(&oldest);
            }
        }
        self.order.push_back(summary.operation_id.clone());
        self.summaries.insert(summary.operation_id.clone(), summary);
    }
}

/// Conflict resolver.
///
/// Handling is idempotent per operation id: a second notification for an
/// operation already resolved returns the earlier summary and publishes
/// nothing.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    client_owned_fields: Vec<String>,
    events: EventBus,
    handled: Mutex<Handled>,
}

impl ConflictResolver {
    /// Create a resolver publishing to `events`.
    pub fn new(strategy: ConflictStrategy, events: EventBus) -> Self {
        Self {
            strategy,
            client_owned_fields: Vec::new(),
            events,
            handled: Mutex::new(Handled::default()),
        }
    }

    /// Fields whose local value survives a merge.
    pub fn with_client_owned_fields(mut self, fields: Vec<String>) -> Self {
        self.client_owned_fields = fields;
        self
    }

    /// Get the configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Reconcile a 409 response for one operation.
    ///
    /// `local_body` is the request body that was rejected, used when
    /// merging.
    pub fn handle_conflict_response(
        &self,
        operation_id: &str,
        operation_label: &str,
        body: &[u8],
        local_body: Option<&[u8]>,
    ) -> ResolutionSummary {
        let mut handled = self.handled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = handled.summaries.get(operation_id) {
            debug!("Conflict for {} already resolved, skipping", operation_id);
            return existing.clone();
        }

        let parsed: ConflictBody = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable conflict body for {}: {}", operation_label, e);
                ConflictBody::default()
            }
        };

        let (kind, resolved_state) = self.resolve_state(parsed.server_state, local_body);
        let message = parsed
            .message
            .unwrap_or_else(|| format!("{} changed on the server", operation_label));

        let summary = ResolutionSummary {
            operation_id: operation_id.to_string(),
            operation_label: operation_label.to_string(),
            message,
            kind,
            resolved_state,
            server_version: parsed.version,
            resolved_at: Utc::now(),
        };

        info!(
            "Resolved conflict for {}: {}",
            operation_label,
            kind.describe()
        );
        handled.remember(summary.clone());
        drop(handled);

        self.events.publish(SyncEvent::ConflictResolved {
            operation_label: summary.operation_label.clone(),
            message: summary.message.clone(),
            resolution: summary.kind,
        });

        summary
    }

    /// Summary of an already-resolved operation.
    pub fn resolution_for(&self, operation_id: &str) -> Option<ResolutionSummary> {
        let handled = self.handled.lock().unwrap_or_else(PoisonError::into_inner);
        handled.summaries.get(operation_id).cloned()
    }

    fn resolve_state(
        &self,
        server_state: Option<Value>,
        local_body: Option<&[u8]>,
    ) -> (ResolutionKind, Option<Value>) {
        if self.strategy == ConflictStrategy::ServerWins || self.client_owned_fields.is_empty() {
            return (ResolutionKind::ServerWins, server_state);
        }

        let local: Option<Value> = local_body.and_then(|b| serde_json::from_slice(b).ok());
        match (server_state, local) {
            (Some(Value::Object(mut server)), Some(Value::Object(local))) => {
                let mut merged_any = false;
                for field in &self.client_owned_fields {
                    if let Some(value) = local.get(field) {
                        server.insert(field.clone(), value.clone());
                        merged_any = true;
                    }
                }
                let kind = if merged_any {
                    ResolutionKind::Merged
                } else {
                    ResolutionKind::ServerWins
                };
                (kind, Some(Value::Object(server)))
            }
            (server_state, _) => (ResolutionKind::ServerWins, server_state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_wins_by_default() {
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins, EventBus::default());
        let body = json!({"message": "Entry was edited elsewhere", "current": {"calories": 420}, "version": 7});

        let summary = resolver.handle_conflict_response(
            "op-1",
            "Log lunch",
            body.to_string().as_bytes(),
            Some(br#"{"calories": 500}"#),
        );

        assert_eq!(summary.kind, ResolutionKind::ServerWins);
        assert_eq!(summary.message, "Entry was edited elsewhere");
        assert_eq!(summary.resolved_state, Some(json!({"calories": 420})));
        assert_eq!(summary.server_version, Some(7));
    }

    #[test]
    fn test_merge_keeps_client_owned_fields() {
        let resolver = ConflictResolver::new(ConflictStrategy::MergeFields, EventBus::default())
            .with_client_owned_fields(vec!["note".to_string()]);
        let body = json!({"server_state": {"amount": 12, "note": "old"}});

        let summary = resolver.handle_conflict_response(
            "op-2",
            "Edit transaction",
            body.to_string().as_bytes(),
            Some(br#"{"amount": 15, "note": "coffee with Sam"}"#),
        );

        assert_eq!(summary.kind, ResolutionKind::Merged);
        assert_eq!(
            summary.resolved_state,
            Some(json!({"amount": 12, "note": "coffee with Sam"}))
        );
    }

    #[test]
    fn test_unparseable_body_falls_back_to_server_wins() {
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins, EventBus::default());
        let summary = resolver.handle_conflict_response("op-3", "Add income", b"<html>", None);

        assert_eq!(summary.kind, ResolutionKind::ServerWins);
        assert_eq!(summary.message, "Add income changed on the server");
        assert!(summary.resolved_state.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_notifications_publish_once() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let resolver = ConflictResolver::new(ConflictStrategy::ServerWins, events);

        let first = resolver.handle_conflict_response("op-4", "Check in habit", b"{}", None);
        let second = resolver.handle_conflict_response("op-4", "Check in habit", b"{}", None);

        assert_eq!(first.resolved_at, second.resolved_at);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::ConflictResolved { .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(resolver.resolution_for("op-4").is_some());
    }
}
