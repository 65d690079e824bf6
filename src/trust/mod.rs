//! Beta-Bernoulli trust model
//!
//! Every pattern carries Beta(alpha, beta) parameters seeded from a
//! configurable prior. Successes add to alpha, failures to beta. When a
//! pattern goes unused its parameters decay back toward the prior with a
//! per-type half-life, so old evidence counts for less than fresh evidence.
//!
//! Two point estimates are exposed:
//! - the posterior mean, used as the trust value
//! - the Wilson lower bound, a conservative estimate used for ranking

pub mod beta;

use crate::config::TrustConfig;
use crate::types::{Pattern, TrustParams};
use beta::{beta_quantile, wilson_lower_bound, Quantile};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Elapsed time below which an update does not decay first
const DECAY_GRACE_DAYS: f64 = 1.0;

/// Computed trust for a pattern or a raw success/failure count
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    /// Posterior mean alpha/(alpha+beta)
    pub value: f64,
    /// 1 - width of the 95% credible interval
    pub confidence: f64,
    pub lower: f64,
    pub upper: f64,
    pub wilson_lower: f64,
    pub sample_count: u64,
    /// Set when an interval bound came from a non-converged quantile search
    pub low_confidence: bool,
}

/// Before/after view of a single trust update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustUpdate {
    pub previous: TrustParams,
    pub current: TrustParams,
    /// Days of decay applied before the increment, if any
    pub decayed_days: Option<f64>,
}

pub struct TrustModel {
    config: TrustConfig,
    /// Wilson lower bound keyed by the bit patterns of (alpha, beta)
    wilson_cache: Cache<(u64, u64), f64>,
}

impl TrustModel {
    pub fn new(config: TrustConfig) -> Self {
        let wilson_cache = Cache::builder()
            .max_capacity(config.wilson_cache_capacity)
            .build();
        Self {
            config,
            wilson_cache,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Prior parameters a fresh pattern starts from
    pub fn prior(&self) -> TrustParams {
        TrustParams::new(self.config.prior_alpha, self.config.prior_beta)
    }

    /// Trust for raw counts on top of the configured prior
    pub fn calculate_trust(&self, successes: u64, failures: u64) -> TrustScore {
        let alpha = self.config.prior_alpha + successes as f64;
        let beta = self.config.prior_beta + failures as f64;
        self.score_params(alpha, beta, successes + failures)
    }

    /// Trust for a stored pattern
    pub fn score_pattern(&self, pattern: &Pattern) -> TrustScore {
        self.score_params(
            pattern.trust.alpha,
            pattern.trust.beta,
            pattern.usage.total(),
        )
    }

    pub fn score_params(&self, alpha: f64, beta: f64, sample_count: u64) -> TrustScore {
        let value = alpha / (alpha + beta);
        let (lower, upper) = self.credible_interval(alpha, beta);
        let width = (upper.value - lower.value).max(0.0);

        TrustScore {
            value,
            confidence: (1.0 - width).clamp(0.0, 1.0),
            lower: lower.value,
            upper: upper.value,
            wilson_lower: self.wilson_lower(alpha, beta),
            sample_count,
            low_confidence: !(lower.converged && upper.converged),
        }
    }

    /// 95% credible interval of Beta(alpha, beta)
    pub fn credible_interval(&self, alpha: f64, beta: f64) -> (Quantile, Quantile) {
        let quantile = |p| {
            beta_quantile(
                p,
                alpha,
                beta,
                self.config.quantile_tolerance,
                self.config.quantile_max_iterations,
                self.config.normal_approx_threshold,
            )
        };
        (quantile(0.025), quantile(0.975))
    }

    /// Memoized Wilson lower bound
    pub fn wilson_lower(&self, alpha: f64, beta: f64) -> f64 {
        let key = (alpha.to_bits(), beta.to_bits());
        if let Some(hit) = self.wilson_cache.get(&key) {
            return hit;
        }
        let lower = wilson_lower_bound(alpha, beta);
        self.wilson_cache.insert(key, lower);
        lower
    }

    /// Pull parameters toward the prior by 0.5^(elapsed/half_life).
    ///
    /// Zero or negative elapsed time is a no-op. When the decayed value falls
    /// under `min_trust`, beta is pulled further toward its prior (never past
    /// it) so the floor holds without inventing successes.
    pub fn apply_decay(&self, params: &TrustParams, elapsed_days: f64, half_life_days: f64) -> TrustParams {
        if elapsed_days <= 0.0 || half_life_days <= 0.0 {
            return params.clone();
        }

        let factor = 0.5_f64.powf(elapsed_days / half_life_days);
        let prior_alpha = self.config.prior_alpha;
        let prior_beta = self.config.prior_beta;

        let alpha = prior_alpha + (params.alpha - prior_alpha) * factor;
        let mut beta = prior_beta + (params.beta - prior_beta) * factor;

        let min_trust = self.config.min_trust;
        if min_trust > 0.0 && min_trust < 1.0 && alpha / (alpha + beta) < min_trust && beta > prior_beta {
            beta = (alpha * (1.0 - min_trust) / min_trust).max(prior_beta);
        }

        TrustParams {
            alpha,
            beta,
            last_updated: params.last_updated,
        }
    }

    /// Apply one outcome to a pattern's trust parameters.
    ///
    /// Decays first when more than a day has passed since the last update.
    /// Persistence is the caller's job.
    pub fn update_trust(&self, pattern: &mut Pattern, success: bool, at: DateTime<Utc>) -> TrustUpdate {
        let previous = pattern.trust.clone();
        let mut decayed_days = None;

        if let Some(last) = previous.last_updated {
            let elapsed_days = (at - last).num_seconds() as f64 / 86_400.0;
            if elapsed_days > DECAY_GRACE_DAYS {
                let half_life = self.config.half_life_for(pattern.pattern_type);
                pattern.trust = self.apply_decay(&pattern.trust, elapsed_days, half_life);
                decayed_days = Some(elapsed_days);
                debug!(
                    pattern_id = %pattern.id,
                    elapsed_days,
                    half_life,
                    "decayed trust before update"
                );
            }
        }

        if success {
            pattern.trust.alpha += 1.0;
        } else {
            pattern.trust.beta += 1.0;
        }

        pattern.trust.last_updated = Some(match previous.last_updated {
            Some(last) if last > at => last,
            _ => at,
        });

        TrustUpdate {
            previous,
            current: pattern.trust.clone(),
            decayed_days,
        }
    }
}

impl Default for TrustModel {
    fn default() -> Self {
        Self::new(TrustConfig::default())
    }
}
