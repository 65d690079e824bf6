use crate::config::ScoringConfig;
use crate::types::Pattern;
use chrono::{DateTime, Utc};

/// Point budget for the freshness factor
pub const FRESHNESS_BUDGET: f64 = 20.0;

/// Exponential freshness decay on the last review date
#[derive(Debug, Clone)]
pub struct FreshnessScorer {
    half_life_days: f64,
    missing_review_age_days: f64,
}

impl FreshnessScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            half_life_days: config.freshness_half_life_days,
            missing_review_age_days: config.missing_review_age_days,
        }
    }

    /// Age in days; unreviewed patterns count as `missing_review_age_days` old
    pub fn age_days(&self, last_reviewed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        match last_reviewed {
            Some(at) => ((now - at).num_seconds() as f64 / 86_400.0).max(0.0),
            None => self.missing_review_age_days,
        }
    }

    /// e^(-ln2 · age / half_life), in [0, 1]
    pub fn factor(&self, last_reviewed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        let age = self.age_days(last_reviewed, now);
        if self.half_life_days <= 0.0 {
            return 0.0;
        }
        (-std::f64::consts::LN_2 * age / self.half_life_days)
            .exp()
            .clamp(0.0, 1.0)
    }

    pub fn score(&self, pattern: &Pattern, now: DateTime<Utc>) -> f64 {
        FRESHNESS_BUDGET * self.factor(pattern.last_reviewed, now)
    }
}

impl Default for FreshnessScorer {
    fn default() -> Self {
        Self::new(&ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_just_reviewed_gets_full_budget() {
        let scorer = FreshnessScorer::default();
        let now = Utc::now();
        assert!((scorer.factor(Some(now), now) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_half_life_halves_score() {
        let scorer = FreshnessScorer::default();
        let now = Utc::now();
        let factor = scorer.factor(Some(now - Duration::days(90)), now);
        assert!((factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_review_counts_as_a_year_old() {
        let scorer = FreshnessScorer::default();
        let now = Utc::now();
        let missing = scorer.factor(None, now);
        let year = scorer.factor(Some(now - Duration::days(365)), now);
        assert!((missing - year).abs() < 1e-9);
    }

    #[test]
    fn test_future_review_date_clamps() {
        let scorer = FreshnessScorer::default();
        let now = Utc::now();
        assert_eq!(scorer.factor(Some(now + Duration::days(3)), now), 1.0);
    }
}
