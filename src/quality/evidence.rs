//! Evidence standards
//!
//! How much the recorded outcomes of a pattern can be believed:
//! - success rate (40%)
//! - diversity across automated tests, manual checks and production (20%)
//! - log-scaled quantity (20%)
//! - type-weighted ratio, where a production success counts more than a
//!   success seen during development (20%)
//!
//! Promotion needs at least 3 uses, a success rate of 0.8 and a quality of 0.6.

use crate::types::{EvidenceType, Pattern};
use serde::{Deserialize, Serialize};

pub const MIN_PROMOTION_USES: u64 = 3;
pub const MIN_PROMOTION_SUCCESS_RATE: f64 = 0.8;
pub const MIN_PROMOTION_QUALITY: f64 = 0.6;

/// (uses, score) knots, interpolated in log space
const QUANTITY_KNOTS: [(f64, f64); 5] = [(1.0, 0.2), (3.0, 0.5), (10.0, 0.7), (100.0, 0.9), (1000.0, 1.0)];

/// Evidence kinds that count toward diversity
const DIVERSE_KINDS: [EvidenceType; 3] = [
    EvidenceType::AutomatedTest,
    EvidenceType::ManualVerification,
    EvidenceType::ProductionUsage,
];

pub fn type_weight(evidence: EvidenceType) -> f64 {
    match evidence {
        EvidenceType::AutomatedTest => 1.0,
        EvidenceType::ProductionUsage => 1.0,
        EvidenceType::CiValidation => 0.9,
        EvidenceType::ManualVerification => 0.8,
        EvidenceType::DevelopmentUsage => 0.6,
    }
}

/// Piecewise log-linear between the knots; 0 uses scores 0
pub fn quantity_score(uses: u64) -> f64 {
    if uses == 0 {
        return 0.0;
    }
    let x = uses as f64;
    let (first_x, first_y) = QUANTITY_KNOTS[0];
    if x <= first_x {
        return first_y;
    }
    for pair in QUANTITY_KNOTS.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if x <= x1 {
            let t = (x.ln() - x0.ln()) / (x1.ln() - x0.ln());
            return y0 + t * (y1 - y0);
        }
    }
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceQuality {
    pub success_rate: f64,
    pub diversity: f64,
    pub quantity: f64,
    pub type_weighted: f64,
    /// Weighted sum, in [0, 1]
    pub overall: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionCriterion {
    MinimumUses,
    SuccessRate,
    EvidenceQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Approved {
        quality: f64,
    },
    Rejected {
        criterion: PromotionCriterion,
        reason: String,
    },
}

impl PromotionDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PromotionDecision::Approved { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceStandards;

impl EvidenceStandards {
    pub fn new() -> Self {
        Self
    }

    pub fn quality(&self, pattern: &Pattern) -> EvidenceQuality {
        let counts = &pattern.evidence_counts;
        let success_rate = pattern.usage.success_rate();

        let diversity = DIVERSE_KINDS
            .iter()
            .filter(|kind| counts.get(*kind).copied().unwrap_or(0) > 0)
            .count() as f64
            / DIVERSE_KINDS.len() as f64;

        let quantity = quantity_score(pattern.usage.total());

        let counted: u64 = counts.values().sum();
        let type_weighted = if counted == 0 {
            0.0
        } else {
            counts
                .iter()
                .map(|(kind, n)| type_weight(*kind) * *n as f64)
                .sum::<f64>()
                / counted as f64
        };

        let overall = (0.4 * success_rate + 0.2 * diversity + 0.2 * quantity + 0.2 * type_weighted).clamp(0.0, 1.0);

        EvidenceQuality {
            success_rate,
            diversity,
            quantity,
            type_weighted,
            overall,
        }
    }

    /// Checks uses, then success rate, then quality; the first failure is reported
    pub fn meets_promotion_standards(&self, pattern: &Pattern) -> PromotionDecision {
        let uses = pattern.usage.total();
        if uses < MIN_PROMOTION_USES {
            return PromotionDecision::Rejected {
                criterion: PromotionCriterion::MinimumUses,
                reason: format!("{} uses recorded, {} required", uses, MIN_PROMOTION_USES),
            };
        }

        let rate = pattern.usage.success_rate();
        if rate < MIN_PROMOTION_SUCCESS_RATE {
            return PromotionDecision::Rejected {
                criterion: PromotionCriterion::SuccessRate,
                reason: format!(
                    "success rate {:.2} is below {:.2}",
                    rate, MIN_PROMOTION_SUCCESS_RATE
                ),
            };
        }

        let quality = self.quality(pattern).overall;
        if quality < MIN_PROMOTION_QUALITY {
            return PromotionDecision::Rejected {
                criterion: PromotionCriterion::EvidenceQuality,
                reason: format!(
                    "evidence quality {:.2} is below {:.2}",
                    quality, MIN_PROMOTION_QUALITY
                ),
            };
        }

        PromotionDecision::Approved { quality }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(successes: u64, failures: u64, evidence: &[(EvidenceType, u64)]) -> Pattern {
        let mut p = Pattern::new("acme.web:CODEBASE:http:retry", "Retry", "Retry").unwrap();
        p.usage.successes = successes;
        p.usage.failures = failures;
        p.evidence_counts = evidence.iter().copied().collect();
        p
    }

    #[test]
    fn test_quantity_knots() {
        assert_eq!(quantity_score(0), 0.0);
        assert_eq!(quantity_score(1), 0.2);
        assert!((quantity_score(3) - 0.5).abs() < 1e-12);
        assert!((quantity_score(10) - 0.7).abs() < 1e-12);
        assert!((quantity_score(100) - 0.9).abs() < 1e-12);
        assert_eq!(quantity_score(5000), 1.0);
        let mid = quantity_score(30);
        assert!(mid > 0.7 && mid < 0.9);
    }

    #[test]
    fn test_quality_components() {
        let p = pattern(
            8,
            2,
            &[(EvidenceType::AutomatedTest, 5), (EvidenceType::DevelopmentUsage, 5)],
        );
        let q = EvidenceStandards.quality(&p);
        assert!((q.success_rate - 0.8).abs() < 1e-12);
        assert!((q.diversity - 1.0 / 3.0).abs() < 1e-12);
        assert!((q.quantity - 0.7).abs() < 1e-12);
        assert!((q.type_weighted - 0.8).abs() < 1e-12);
        let expected = 0.4 * 0.8 + 0.2 / 3.0 + 0.2 * 0.7 + 0.2 * 0.8;
        assert!((q.overall - expected).abs() < 1e-12);
    }

    #[test]
    fn test_promotion_needs_three_uses() {
        let two = pattern(2, 0, &[(EvidenceType::AutomatedTest, 2)]);
        match EvidenceStandards.meets_promotion_standards(&two) {
            PromotionDecision::Rejected { criterion, .. } => {
                assert_eq!(criterion, PromotionCriterion::MinimumUses)
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let three = pattern(3, 0, &[(EvidenceType::AutomatedTest, 3)]);
        assert!(EvidenceStandards.meets_promotion_standards(&three).is_approved());
    }

    #[test]
    fn test_promotion_success_rate_boundary() {
        let at_boundary = pattern(4, 1, &[(EvidenceType::AutomatedTest, 5)]);
        assert!(EvidenceStandards.meets_promotion_standards(&at_boundary).is_approved());

        let below = pattern(3, 1, &[(EvidenceType::AutomatedTest, 4)]);
        match EvidenceStandards.meets_promotion_standards(&below) {
            PromotionDecision::Rejected { criterion, reason } => {
                assert_eq!(criterion, PromotionCriterion::SuccessRate);
                assert!(reason.contains("0.75"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_promotion_rejects_weak_evidence() {
        // no typed evidence at all: 0.4 + 0 + 0.2 * q(3) + 0 = 0.5
        let p = pattern(3, 0, &[]);
        match EvidenceStandards.meets_promotion_standards(&p) {
            PromotionDecision::Rejected { criterion, .. } => {
                assert_eq!(criterion, PromotionCriterion::EvidenceQuality)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
