//! Multi-factor ranking
//!
//! Four pure scorers with fixed point budgets that sum to 100:
//!
//! | Factor    | Budget |
//! |-----------|--------|
//! | trust     | 30     |
//! | freshness | 20     |
//! | scope     | 40     |
//! | locality  | 10     |
//!
//! Because the budgets are fixed, totals are directly comparable across
//! requests. Ties go to the newest pattern, then to the lower id.

pub mod freshness;
pub mod locality;
pub mod scope;
pub mod trust;

use crate::config::ScoringConfig;
use crate::trust::TrustModel;
use crate::types::{Pattern, QuerySignals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

pub use freshness::{FreshnessScorer, FRESHNESS_BUDGET};
pub use locality::{LocalityScorer, LOCALITY_BUDGET};
pub use scope::{ScopeBreakdown, ScopeScorer, SCOPE_BUDGET};
pub use trust::{TrustScorer, TRUST_BUDGET};

/// Per-factor points for one pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub trust: f64,
    pub freshness: f64,
    pub scope: f64,
    pub locality: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.trust + self.freshness + self.scope + self.locality
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPattern {
    pub pattern: Pattern,
    pub breakdown: ScoreBreakdown,
    pub score: f64,
}

pub struct RankingEngine {
    trust: TrustScorer,
    freshness: FreshnessScorer,
    scope: ScopeScorer,
    locality: LocalityScorer,
}

impl RankingEngine {
    pub fn new(model: Arc<TrustModel>, config: &ScoringConfig) -> Self {
        Self {
            trust: TrustScorer::new(model),
            freshness: FreshnessScorer::new(config),
            scope: ScopeScorer::new(),
            locality: LocalityScorer::new(),
        }
    }

    pub fn freshness(&self) -> &FreshnessScorer {
        &self.freshness
    }

    pub fn breakdown(&self, pattern: &Pattern, signals: &QuerySignals, now: DateTime<Utc>) -> ScoreBreakdown {
        ScoreBreakdown {
            trust: self.trust.score(pattern),
            freshness: self.freshness.score(pattern, now),
            scope: self.scope.score(&pattern.scope, signals),
            locality: self.locality.score(pattern, signals),
        }
    }

    /// Score every pattern and sort best first
    pub fn rank(&self, patterns: Vec<Pattern>, signals: &QuerySignals, now: DateTime<Utc>) -> Vec<ScoredPattern> {
        let mut scored: Vec<ScoredPattern> = patterns
            .into_iter()
            .map(|pattern| {
                let breakdown = self.breakdown(&pattern, signals, now);
                ScoredPattern {
                    score: breakdown.total(),
                    breakdown,
                    pattern,
                }
            })
            .collect();

        scored.sort_by(|a, b| compare_ranked(a.score, &a.pattern, b.score, &b.pattern));
        scored
    }
}

/// Descending score, then newest `created_at`, then ascending id
pub fn compare_ranked(score_a: f64, a: &Pattern, score_b: f64, b: &Pattern) -> Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustParams;
    use chrono::Duration;
    use proptest::prelude::*;

    fn engine() -> RankingEngine {
        RankingEngine::new(Arc::new(TrustModel::default()), &ScoringConfig::default())
    }

    #[test]
    fn test_tie_broken_by_newest() {
        let now = Utc::now();
        let mut old = Pattern::new("acme.web:LANG:http:a", "A", "A").unwrap();
        let mut new = Pattern::new("acme.web:LANG:http:b", "B", "B").unwrap();
        old.created_at = now - Duration::days(10);
        new.created_at = now - Duration::days(1);

        let ranked = engine().rank(vec![old, new], &QuerySignals::default(), now);
        assert_eq!(ranked[0].score, ranked[1].score);
        assert_eq!(ranked[0].pattern.id, "acme.web:LANG:http:b");
    }

    #[test]
    fn test_trusted_pattern_ranks_first() {
        let now = Utc::now();
        let mut strong = Pattern::new("acme.web:LANG:http:strong", "S", "S").unwrap();
        strong.trust = TrustParams::new(50.0, 2.0);
        let weak = Pattern::new("acme.web:LANG:http:weak", "W", "W").unwrap();

        let ranked = engine().rank(vec![weak, strong], &QuerySignals::default(), now);
        assert_eq!(ranked[0].pattern.id, "acme.web:LANG:http:strong");
    }

    proptest! {
        #[test]
        fn factors_stay_within_budgets(
            alpha in 0.01f64..1000.0,
            beta in 0.01f64..1000.0,
            age_days in 0i64..5000,
            reviewed in any::<bool>(),
        ) {
            let now = Utc::now();
            let mut p = Pattern::new("acme.web:LANG:http:x", "X", "X").unwrap();
            p.trust = TrustParams::new(alpha, beta);
            p.last_reviewed = reviewed.then(|| now - Duration::days(age_days));
            p.scope.languages = vec!["rust".to_string()];
            p.scope.repos = vec!["acme/*".to_string()];

            let signals = QuerySignals {
                language: Some("rust".to_string()),
                repo: Some("acme/web".to_string()),
                ..Default::default()
            };
            let b = engine().breakdown(&p, &signals, now);
            prop_assert!((0.0..=TRUST_BUDGET).contains(&b.trust));
            prop_assert!((0.0..=FRESHNESS_BUDGET).contains(&b.freshness));
            prop_assert!((0.0..=SCOPE_BUDGET).contains(&b.scope));
            prop_assert!((0.0..=LOCALITY_BUDGET).contains(&b.locality));
            prop_assert!(b.total() <= 100.0);
        }
    }
}
