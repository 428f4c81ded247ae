//! Per-domain sync state and staleness classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use lifetrack_common::Domain;

/// Freshness of a domain's data, from time since its last confirmed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    Fresh,
    Aging,
    Stale,
}

impl Staleness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Staleness::Fresh => "fresh",
            Staleness::Aging => "aging",
            Staleness::Stale => "stale",
        }
    }
}

/// Age thresholds separating fresh, aging and stale data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessThresholds {
    /// Data younger than this is fresh.
    pub fresh: Duration,
    /// Data younger than this (and not fresh) is aging.
    pub aging: Duration,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            fresh: Duration::from_secs(5 * 60),
            aging: Duration::from_secs(30 * 60),
        }
    }
}

impl StalenessThresholds {
    /// Classify data last confirmed at `last_success`.
    ///
    /// Data that was never confirmed is stale. A timestamp in the future
    /// counts as age zero.
    pub fn classify(&self, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Staleness {
        let Some(last_success) = last_success else {
            return Staleness::Stale;
        };

        let age = (now - last_success).to_std().unwrap_or(Duration::ZERO);
        if age < self.fresh {
            Staleness::Fresh
        } else if age < self.aging {
            Staleness::Aging
        } else {
            Staleness::Stale
        }
    }
}

/// Observable sync state of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainState {
    pub is_syncing: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_from_cache: bool,
    pub staleness: Staleness,
    pub detail: Option<String>,
}

impl Default for DomainState {
    fn default() -> Self {
        Self {
            is_syncing: false,
            last_success: None,
            last_error: None,
            is_from_cache: false,
            staleness: Staleness::Stale,
            detail: None,
        }
    }
}

impl DomainState {
    /// Mark the start of a sync attempt.
    pub fn begin(&mut self) {
        self.is_syncing = true;
        self.detail = Some("Syncing".to_string());
    }

    /// Record a confirmed network success.
    pub fn succeed(&mut self, at: DateTime<Utc>, thresholds: &StalenessThresholds) {
        self.is_syncing = false;
        self.last_success = Some(at);
        self.last_error = None;
        self.is_from_cache = false;
        self.detail = None;
        self.staleness = thresholds.classify(self.last_success, at);
    }

    /// Record a failure, noting whether cached data is being served.
    pub fn fail(
        &mut self,
        error: String,
        from_cache: bool,
        now: DateTime<Utc>,
        thresholds: &StalenessThresholds,
    ) {
        self.is_syncing = false;
        self.is_from_cache = from_cache;
        self.detail = Some(if from_cache {
            "Showing saved data".to_string()
        } else {
            "No data available".to_string()
        });
        self.last_error = Some(error);
        self.staleness = thresholds.classify(self.last_success, now);
    }

    /// Recompute staleness against `now`.
    pub fn refresh(&mut self, now: DateTime<Utc>, thresholds: &StalenessThresholds) {
        self.staleness = thresholds.classify(self.last_success, now);
    }
}

/// Snapshot of every domain's state, published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub domains: BTreeMap<Domain, DomainState>,
    pub is_syncing_all: bool,
}

impl SyncSnapshot {
    /// A snapshot with every known domain in its initial state.
    pub fn initial() -> Self {
        Self {
            domains: Domain::ALL
                .into_iter()
                .map(|d| (d, DomainState::default()))
                .collect(),
            is_syncing_all: false,
        }
    }

    /// State of `domain`.
    pub fn domain(&self, domain: Domain) -> DomainState {
        self.domains.get(&domain).cloned().unwrap_or_default()
    }

    /// Whether any domain sync is in flight.
    pub fn any_syncing(&self) -> bool {
        self.domains.values().any(|s| s.is_syncing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_never_synced_is_stale() {
        let thresholds = StalenessThresholds::default();
        assert_eq!(thresholds.classify(None, Utc::now()), Staleness::Stale);
        assert_eq!(DomainState::default().staleness, Staleness::Stale);
    }

    #[test]
    fn test_classification_boundaries() {
        let thresholds = StalenessThresholds::default();
        let now = Utc::now();

        let at = |minutes: i64| Some(now - ChronoDuration::minutes(minutes));
        assert_eq!(thresholds.classify(at(0), now), Staleness::Fresh);
        assert_eq!(thresholds.classify(at(4), now), Staleness::Fresh);
        assert_eq!(thresholds.classify(at(5), now), Staleness::Aging);
        assert_eq!(thresholds.classify(at(29), now), Staleness::Aging);
        assert_eq!(thresholds.classify(at(30), now), Staleness::Stale);
        assert_eq!(
            thresholds.classify(Some(now + ChronoDuration::minutes(1)), now),
            Staleness::Fresh
        );
    }

    #[test]
    fn test_failure_keeps_last_success_and_ages_from_it() {
        let thresholds = StalenessThresholds::default();
        let synced_at = Utc::now() - ChronoDuration::minutes(10);
        let mut state = DomainState::default();

        state.begin();
        assert!(state.is_syncing);
        state.succeed(synced_at, &thresholds);
        state.begin();
        state.fail("server-unavailable".to_string(), true, Utc::now(), &thresholds);

        assert!(!state.is_syncing);
        assert!(state.is_from_cache);
        assert_eq!(state.last_success, Some(synced_at));
        assert_eq!(state.last_error.as_deref(), Some("server-unavailable"));
        assert_eq!(state.staleness, Staleness::Aging);
    }

    #[test]
    fn test_success_clears_error_and_cache_flag() {
        let thresholds = StalenessThresholds::default();
        let mut state = DomainState::default();
        state.fail("server-error(503)".to_string(), true, Utc::now(), &thresholds);

        state.succeed(Utc::now(), &thresholds);

        assert!(state.last_error.is_none());
        assert!(!state.is_from_cache);
        assert_eq!(state.staleness, Staleness::Fresh);
    }

    #[test]
    fn test_initial_snapshot_covers_every_domain() {
        let snapshot = SyncSnapshot::initial();
        assert_eq!(snapshot.domains.len(), Domain::ALL.len());
        assert!(!snapshot.any_syncing());
        assert!(!snapshot.is_syncing_all);
    }
}
