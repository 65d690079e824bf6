use crate::trust::TrustModel;
use crate::types::Pattern;
use std::sync::Arc;

/// Point budget for the trust factor
pub const TRUST_BUDGET: f64 = 30.0;

/// `30 × wilson_lower(alpha, beta)`, memoized through the trust model
pub struct TrustScorer {
    model: Arc<TrustModel>,
}

impl TrustScorer {
    pub fn new(model: Arc<TrustModel>) -> Self {
        Self { model }
    }

    pub fn score(&self, pattern: &Pattern) -> f64 {
        self.score_params(pattern.trust.alpha, pattern.trust.beta)
    }

    pub fn score_params(&self, alpha: f64, beta: f64) -> f64 {
        (TRUST_BUDGET * self.model.wilson_lower(alpha, beta)).clamp(0.0, TRUST_BUDGET)
    }
}
