//! Outcome Recording - the learning loop
//!
//! Every success or failure observed for a pattern flows through here:
//! 1. Trust parameters are decayed (if stale) and updated
//! 2. Usage and per-evidence-type counters are bumped
//! 3. The quarantine rule is re-evaluated
//! 4. The pattern is written back with an optimistic version check
//! 5. Quality and conflict caches for the pattern are dropped
//!
//! Outcomes for the same pattern serialize on a per-id lock and apply in
//! timestamp order. Different patterns proceed in parallel.

use crate::config::OutcomeConfig;
use crate::error::{PatternError, Result};
use crate::quality::{PatternQualityManager, QuarantineChange};
use crate::storage::{self, PatternStore};
use crate::trust::TrustModel;
use crate::types::EvidenceType;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One observed outcome for a pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub pattern_id: String,
    pub success: bool,
    pub evidence_type: EvidenceType,
    /// Free-form caller context, carried through for logging only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(pattern_id: &str, success: bool, evidence_type: EvidenceType) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            success,
            evidence_type,
            context: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// What recording one outcome changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeResult {
    pub pattern_id: String,
    pub success: bool,
    pub previous_trust: f64,
    pub new_trust: f64,
    /// Days of decay applied before the update, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decayed_days: Option<f64>,
    pub quarantine: QuarantineChange,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Applied { result: OutcomeResult },
    Failed { pattern_id: String, error: String },
}

impl BatchItem {
    pub fn is_applied(&self) -> bool {
        matches!(self, BatchItem::Applied { .. })
    }
}

/// Per-item results, in the order the events were submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternTrust {
    pub pattern_id: String,
    pub title: String,
    pub trust: f64,
    pub uses: u64,
}

/// Learning statistics summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub patterns_scanned: usize,
    pub patterns_with_usage: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub quarantined: usize,
    pub most_trusted: Vec<PatternTrust>,
    pub least_trusted: Vec<PatternTrust>,
}

#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn PatternStore>,
    trust: Arc<TrustModel>,
    quality: Arc<PatternQualityManager>,
    config: OutcomeConfig,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OutcomeRecorder {
    pub fn new(
        store: Arc<dyn PatternStore>,
        trust: Arc<TrustModel>,
        quality: Arc<PatternQualityManager>,
        config: &OutcomeConfig,
    ) -> Self {
        Self {
            store,
            trust,
            quality,
            config: config.clone(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Record one outcome.
    ///
    /// Retries on version conflicts from writers outside this recorder, up
    /// to `max_version_retries`.
    pub async fn record(&self, event: &OutcomeEvent) -> Result<OutcomeResult> {
        let id = event.pattern_id.as_str();
        let result = {
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;

            let mut attempts = 0;
            loop {
                match self.apply(event).await {
                    Err(PatternError::VersionConflict { expected, actual, .. })
                        if attempts < self.config.max_version_retries =>
                    {
                        attempts += 1;
                        warn!(id, expected, actual, attempts, "Version conflict recording outcome, retrying");
                    }
                    other => break other,
                }
            }
        };
        self.release_lock(id);

        let result = result?;
        self.quality.invalidate(id);
        self.quality.conflicts().invalidate(id);
        Ok(result)
    }

    async fn apply(&self, event: &OutcomeEvent) -> Result<OutcomeResult> {
        let mut pattern = storage::require(self.store.as_ref(), &event.pattern_id).await?;
        let expected = pattern.version;

        let update = self.trust.update_trust(&mut pattern, event.success, event.occurred_at);
        if event.success {
            pattern.usage.successes += 1;
        } else {
            pattern.usage.failures += 1;
        }
        *pattern.evidence_counts.entry(event.evidence_type).or_insert(0) += 1;
        pattern.usage.last_used = Some(match pattern.usage.last_used {
            Some(last) if last > event.occurred_at => last,
            _ => event.occurred_at,
        });

        let now = Utc::now();
        pattern.quality.last_activity = Some(now);
        let quarantine = self.quality.check_quarantine(&mut pattern, now);

        let version = self.store.upsert(&pattern, Some(expected)).await?;
        debug!(
            id = %pattern.id,
            success = event.success,
            evidence = event.evidence_type.as_str(),
            context = ?event.context,
            version,
            "Recorded outcome"
        );

        Ok(OutcomeResult {
            pattern_id: pattern.id,
            success: event.success,
            previous_trust: update.previous.value(),
            new_trust: update.current.value(),
            decayed_days: update.decayed_days,
            quarantine,
            version,
        })
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release_lock(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Record many outcomes.
    ///
    /// Events are grouped by pattern; each group applies in timestamp order
    /// while groups run concurrently. A failing item never aborts the rest.
    pub async fn record_batch(&self, events: Vec<OutcomeEvent>) -> BatchOutcome {
        let ids: Vec<String> = events.iter().map(|e| e.pattern_id.clone()).collect();

        let mut groups: BTreeMap<String, Vec<(usize, OutcomeEvent)>> = BTreeMap::new();
        for (index, event) in events.into_iter().enumerate() {
            groups.entry(event.pattern_id.clone()).or_default().push((index, event));
        }

        let mut tasks = JoinSet::new();
        for (_, mut group) in groups {
            group.sort_by(|(ia, a), (ib, b)| a.occurred_at.cmp(&b.occurred_at).then(ia.cmp(ib)));
            let recorder = self.clone();
            tasks.spawn(async move {
                let mut results = Vec::with_capacity(group.len());
                for (index, event) in group {
                    results.push((index, recorder.record(&event).await));
                }
                results
            });
        }

        let mut slots: Vec<Option<BatchItem>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for (index, result) in results {
                        slots[index] = Some(match result {
                            Ok(result) => BatchItem::Applied { result },
                            Err(e) => BatchItem::Failed {
                                pattern_id: ids[index].clone(),
                                error: e.to_string(),
                            },
                        });
                    }
                }
                Err(e) => warn!(error = %e, "Outcome batch task did not complete"),
            }
        }

        let items: Vec<BatchItem> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, pattern_id)| {
                slot.unwrap_or(BatchItem::Failed {
                    pattern_id,
                    error: "batch task did not complete".to_string(),
                })
            })
            .collect();

        let succeeded = items.iter().filter(|i| i.is_applied()).count();
        BatchOutcome {
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }

    /// Learning statistics over the first `scan_limit` patterns
    pub async fn learning_stats(&self) -> Result<LearningStats> {
        let limits = self.quality.config();
        let patterns = storage::scan(self.store.as_ref(), limits.page_size, limits.scan_limit).await?;

        let total_successes: u64 = patterns.iter().map(|p| p.usage.successes).sum();
        let total_failures: u64 = patterns.iter().map(|p| p.usage.failures).sum();
        let total = total_successes + total_failures;

        let mut used: Vec<PatternTrust> = patterns
            .iter()
            .filter(|p| p.usage.total() > 0)
            .map(|p| PatternTrust {
                pattern_id: p.id.clone(),
                title: p.title.clone(),
                trust: self.trust.score_pattern(p).value,
                uses: p.usage.total(),
            })
            .collect();
        used.sort_by(|a, b| {
            b.trust
                .partial_cmp(&a.trust)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });

        let n = self.config.stats_top_n;
        Ok(LearningStats {
            patterns_scanned: patterns.len(),
            patterns_with_usage: used.len(),
            total_successes,
            total_failures,
            success_rate: if total > 0 {
                total_successes as f64 / total as f64
            } else {
                0.0
            },
            quarantined: patterns.iter().filter(|p| p.is_quarantined()).count(),
            most_trusted: used.iter().take(n).cloned().collect(),
            least_trusted: used.iter().rev().take(n).cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictConfig, QualityConfig, ScoringConfig};
    use crate::quality::{ConflictResolver, QualityStatus};
    use crate::query::FuzzyMatcher;
    use crate::scoring::FreshnessScorer;
    use crate::storage::MemoryStore;
    use crate::types::{Pattern, TrustParams};
    use chrono::Duration;

    const ID: &str = "acme.web:CODEBASE:http:retry";

    async fn setup(patterns: &[Pattern]) -> (Arc<MemoryStore>, OutcomeRecorder, Arc<PatternQualityManager>) {
        let store = Arc::new(MemoryStore::new());
        for p in patterns {
            store.upsert(p, None).await.unwrap();
        }
        let trust = Arc::new(TrustModel::default());
        let conflicts = Arc::new(ConflictResolver::new(
            &ConflictConfig::default(),
            Arc::new(FuzzyMatcher::default()),
        ));
        let quality = Arc::new(PatternQualityManager::new(
            &QualityConfig::default(),
            trust.clone(),
            FreshnessScorer::new(&ScoringConfig::default()),
            conflicts,
        ));
        let recorder = OutcomeRecorder::new(store.clone(), trust, quality.clone(), &OutcomeConfig::default());
        (store, recorder, quality)
    }

    fn pattern(id: &str) -> Pattern {
        Pattern::new(id, "Retry with backoff", "Retry transient HTTP failures").unwrap()
    }

    #[tokio::test]
    async fn test_record_updates_counters() {
        let (store, recorder, _) = setup(&[pattern(ID)]).await;
        let result = recorder
            .record(&OutcomeEvent::new(ID, true, EvidenceType::AutomatedTest))
            .await
            .unwrap();

        assert!(result.new_trust > result.previous_trust);
        assert_eq!(result.version, 2);

        let stored = store.get(ID).await.unwrap().unwrap();
        assert_eq!(stored.usage.successes, 1);
        assert_eq!(stored.trust.alpha, 2.0);
        assert_eq!(stored.evidence_counts[&EvidenceType::AutomatedTest], 1);
        assert!(stored.usage.last_used.is_some());
        assert!(recorder.locks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_pattern_is_not_found() {
        let (_, recorder, _) = setup(&[]).await;
        let err = recorder
            .record(&OutcomeEvent::new(ID, true, EvidenceType::AutomatedTest))
            .await
            .unwrap_err();
        assert!(matches!(err, PatternError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_prior_three_two_scenario() {
        let mut p = pattern(ID);
        p.trust = TrustParams::new(3.0, 2.0);
        let (store, recorder, _) = setup(&[p]).await;

        let at = Utc::now();
        for success in [true; 8].into_iter().chain([false; 2]) {
            recorder
                .record(&OutcomeEvent::new(ID, success, EvidenceType::CiValidation).at(at))
                .await
                .unwrap();
        }

        let stored = store.get(ID).await.unwrap().unwrap();
        let value = stored.trust.value();
        assert!((value - 11.0 / 15.0).abs() < 1e-12);
        assert!((value - 0.733).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_failures_quarantine_and_refresh_cached_quality() {
        let (_, recorder, quality) = setup(&[pattern(ID)]).await;
        let store = recorder.store.clone();

        let before = quality.assess(store.as_ref(), ID).await.unwrap();
        assert_eq!(before.status, QualityStatus::Active);

        let mut last = None;
        for _ in 0..10 {
            last = Some(
                recorder
                    .record(&OutcomeEvent::new(ID, false, EvidenceType::ProductionUsage))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(last.unwrap().quarantine, QuarantineChange::Quarantined);

        let after = quality.assess(store.as_ref(), ID).await.unwrap();
        assert_eq!(after.status, QualityStatus::Quarantined);
    }

    #[tokio::test]
    async fn test_concurrent_records_serialize() {
        let (store, recorder, _) = setup(&[pattern(ID)]).await;
        let mut tasks = JoinSet::new();
        for i in 0..20 {
            let recorder = recorder.clone();
            tasks.spawn(async move {
                recorder
                    .record(&OutcomeEvent::new(ID, i % 2 == 0, EvidenceType::DevelopmentUsage))
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let stored = store.get(ID).await.unwrap().unwrap();
        assert_eq!(stored.usage.total(), 20);
        assert_eq!(stored.version, 21);
    }

    #[tokio::test]
    async fn test_batch_orders_by_timestamp_and_tolerates_failures() {
        let other = "acme.web:LANG:http:timeout";
        let (store, recorder, _) = setup(&[pattern(ID), pattern(other)]).await;
        let t0 = Utc::now() - Duration::days(30);

        let events = vec![
            OutcomeEvent::new(ID, true, EvidenceType::AutomatedTest).at(t0 + Duration::days(10)),
            OutcomeEvent::new("acme.web:LANG:http:missing", true, EvidenceType::AutomatedTest),
            OutcomeEvent::new(ID, false, EvidenceType::AutomatedTest).at(t0),
            OutcomeEvent::new(other, true, EvidenceType::ManualVerification).at(t0),
        ];
        let outcome = recorder.record_batch(events).await;

        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 1);
        assert!(matches!(&outcome.items[1], BatchItem::Failed { pattern_id, .. } if pattern_id.ends_with("missing")));

        // the later event applied second, so it saw ten days of staleness
        match (&outcome.items[0], &outcome.items[2]) {
            (BatchItem::Applied { result: later }, BatchItem::Applied { result: earlier }) => {
                assert!(later.decayed_days.is_some());
                assert!(earlier.decayed_days.is_none());
                assert!(later.version > earlier.version);
            }
            other => panic!("unexpected items {:?}", other),
        }

        let stored = store.get(ID).await.unwrap().unwrap();
        assert_eq!(stored.usage.last_used, Some(t0 + Duration::days(10)));
        assert_eq!(store.get(other).await.unwrap().unwrap().usage.successes, 1);
    }

    #[tokio::test]
    async fn test_learning_stats() {
        let mut good = pattern(ID);
        good.usage.successes = 9;
        good.usage.failures = 1;
        good.trust = TrustParams::new(10.0, 2.0);
        let mut bad = pattern("acme.web:ANTI:http:retry-forever");
        bad.usage.successes = 1;
        bad.usage.failures = 3;
        bad.trust = TrustParams::new(2.0, 4.0);
        let unused = pattern("acme.web:LANG:http:unused");

        let (_, recorder, _) = setup(&[good, bad, unused]).await;
        let stats = recorder.learning_stats().await.unwrap();

        assert_eq!(stats.patterns_scanned, 3);
        assert_eq!(stats.patterns_with_usage, 2);
        assert_eq!(stats.total_successes, 10);
        assert_eq!(stats.total_failures, 4);
        assert!((stats.success_rate - 10.0 / 14.0).abs() < 1e-12);
        assert_eq!(stats.most_trusted[0].pattern_id, ID);
        assert_eq!(stats.least_trusted[0].pattern_id, "acme.web:ANTI:http:retry-forever");
    }
}
