//! Pattern quality and quarantine lifecycle
//!
//! Overall quality blends four signals (weights configurable):
//!
//! ```text
//! overall = trust × 0.4 + freshness × 0.3 + evidence × 0.2 + (1 - conflict penalty) × 0.1
//! ```
//!
//! Patterns that keep failing are quarantined automatically once they have
//! enough uses. Quarantine lifts by itself when the failure rate recovers,
//! or by hand through [`PatternQualityManager::refresh_pattern`], which also
//! grants a reprieve until the next recorded outcome.

use super::cache::GuardedCache;
use super::conflicts::{conflict_penalty, ConflictResolver};
use super::evidence::{EvidenceQuality, EvidenceStandards, PromotionDecision};
use crate::config::QualityConfig;
use crate::error::{PatternError, Result};
use crate::scoring::FreshnessScorer;
use crate::storage::{self, PatternStore};
use crate::trust::TrustModel;
use crate::types::{Pattern, Quarantine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_REFRESH_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Active,
    Quarantined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub pattern_id: String,
    pub trust: f64,
    pub freshness: f64,
    pub evidence: EvidenceQuality,
    /// 1 - conflict penalty
    pub conflict_inverse: f64,
    pub overall: f64,
    pub conflict_count: usize,
    pub status: QualityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<Quarantine>,
    pub promotion: PromotionDecision,
    pub computed_at: DateTime<Utc>,
}

/// What a quarantine check did to a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineChange {
    Unchanged,
    Quarantined,
    Released,
}

pub struct PatternQualityManager {
    config: QualityConfig,
    trust: Arc<TrustModel>,
    freshness: FreshnessScorer,
    evidence: EvidenceStandards,
    conflicts: Arc<ConflictResolver>,
    cache: GuardedCache<QualityScore>,
}

impl PatternQualityManager {
    pub fn new(
        config: &QualityConfig,
        trust: Arc<TrustModel>,
        freshness: FreshnessScorer,
        conflicts: Arc<ConflictResolver>,
    ) -> Self {
        let cache = GuardedCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_secs));
        Self {
            config: config.clone(),
            trust,
            freshness,
            evidence: EvidenceStandards::new(),
            conflicts,
            cache,
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.conflicts
    }

    /// Cached quality for one pattern, applying any due quarantine change.
    ///
    /// A quarantine change is persisted on a best-effort basis: if a
    /// concurrent writer got there first, the next outcome re-evaluates it.
    /// A score computed while the pattern was invalidated is returned but
    /// not cached.
    pub async fn assess(&self, store: &dyn PatternStore, id: &str) -> Result<QualityScore> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(hit);
        }

        let ticket = self.cache.ticket(id);
        let now = Utc::now();
        let mut pattern = storage::require(store, id).await?;
        let change = self.check_quarantine(&mut pattern, now);

        let conflicts = self.conflicts.detect_conflicts(store, id).await?;
        let penalty = conflict_penalty(&conflicts, self.config.max_conflict_penalty);
        let score = self.score(&pattern, penalty, conflicts.len(), now);

        if change != QuarantineChange::Unchanged {
            pattern.quality.overall_score = Some(score.overall);
            pattern.quality.cached_at = Some(now);
            match store.upsert(&pattern, Some(pattern.version)).await {
                Ok(_) => {}
                Err(PatternError::VersionConflict { .. }) => {
                    debug!(id, "Quarantine change lost to a concurrent write");
                }
                Err(e) => return Err(e),
            }
        }

        if !self.cache.insert(id, ticket, score.clone()) {
            debug!(id, "Quality changed during assessment, not caching");
        }
        Ok(score)
    }

    /// Pure quality computation for a pattern and its conflict penalty
    pub fn score(&self, pattern: &Pattern, penalty: f64, conflict_count: usize, now: DateTime<Utc>) -> QualityScore {
        let w = &self.config.weights;
        let trust = self.trust.score_pattern(pattern).value;
        let freshness = self.freshness.factor(pattern.last_reviewed, now);
        let evidence = self.evidence.quality(pattern);
        let conflict_inverse = 1.0 - penalty.clamp(0.0, 1.0);

        let overall = (trust * w.trust
            + freshness * w.freshness
            + evidence.overall * w.evidence
            + conflict_inverse * w.conflicts)
            .clamp(0.0, 1.0);

        QualityScore {
            pattern_id: pattern.id.clone(),
            trust,
            freshness,
            evidence,
            conflict_inverse,
            overall,
            conflict_count,
            status: if pattern.is_quarantined() {
                QualityStatus::Quarantined
            } else {
                QualityStatus::Active
            },
            quarantine: pattern.quality.quarantine.clone(),
            promotion: self.evidence.meets_promotion_standards(pattern),
            computed_at: now,
        }
    }

    /// Quarantine or release based on usage and failure rate.
    ///
    /// A manual refresh suspends this until an outcome newer than the
    /// refresh arrives.
    pub fn check_quarantine(&self, pattern: &mut Pattern, now: DateTime<Utc>) -> QuarantineChange {
        if let Some(override_at) = pattern.quality.quarantine_override_at {
            match pattern.usage.last_used {
                Some(used) if used > override_at => pattern.quality.quarantine_override_at = None,
                _ => return QuarantineChange::Unchanged,
            }
        }

        let uses = pattern.usage.total();
        let rate = pattern.usage.failure_rate();
        let should_quarantine = uses >= self.config.quarantine_min_uses && rate > self.config.quarantine_failure_rate;

        match (should_quarantine, pattern.is_quarantined()) {
            (true, false) => {
                info!(id = %pattern.id, failure_rate = rate, uses, "Quarantining pattern");
                pattern.quality.quarantine = Some(Quarantine {
                    reason: format!(
                        "failure rate {:.2} over {} uses exceeds {:.2}",
                        rate, uses, self.config.quarantine_failure_rate
                    ),
                    quarantined_at: now,
                    failure_rate: rate,
                });
                QuarantineChange::Quarantined
            }
            (false, true) => {
                info!(id = %pattern.id, failure_rate = rate, "Releasing pattern from quarantine");
                pattern.quality.quarantine = None;
                QuarantineChange::Released
            }
            _ => QuarantineChange::Unchanged,
        }
    }

    /// Clear quarantine and caches, then recompute.
    pub async fn refresh_pattern(&self, store: &dyn PatternStore, id: &str) -> Result<QualityScore> {
        let mut attempts = 0;
        loop {
            let mut pattern = storage::require(store, id).await?;
            let now = Utc::now();
            pattern.quality.quarantine = None;
            pattern.quality.quarantine_override_at = Some(now);
            pattern.quality.last_activity = Some(now);

            match store.upsert(&pattern, Some(pattern.version)).await {
                Ok(_) => break,
                Err(PatternError::VersionConflict { .. }) if attempts < MAX_REFRESH_RETRIES => {
                    attempts += 1;
                    warn!(id, attempts, "Retrying refresh after concurrent write");
                }
                Err(e) => return Err(e),
            }
        }

        self.invalidate(id);
        self.conflicts.invalidate(id);
        self.assess(store, id).await
    }

    pub fn invalidate(&self, id: &str) {
        self.cache.invalidate(id);
    }

    /// Quarantined patterns within the scan bound
    pub async fn quarantined(&self, store: &dyn PatternStore) -> Result<Vec<Pattern>> {
        let all = storage::scan(store, self.config.page_size, self.config.scan_limit).await?;
        Ok(all.into_iter().filter(|p| p.is_quarantined()).collect())
    }
}
