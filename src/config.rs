//! Engine configuration
//!
//! Every section has a `Default` that matches production behavior, so a
//! config file only needs to name what it changes.

use crate::types::PatternType;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub trust: TrustConfig,
    pub scoring: ScoringConfig,
    pub query: QueryConfig,
    pub conflicts: ConflictConfig,
    pub quality: QualityConfig,
    pub retrieval: RetrievalConfig,
    pub outcomes: OutcomeConfig,
    /// Flat term -> synonyms table; `None` uses the built-in table
    pub synonyms: Option<BTreeMap<String, Vec<String>>>,
}

impl EngineConfig {
    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        Self::from_json_str(&raw).with_context(|| format!("Invalid config at {:?}", path))
    }

    /// Parse and validate; a config that would break trust math or lift the
    /// query caps is rejected
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let trust = &self.trust;
        ensure!(
            trust.prior_alpha.is_finite() && trust.prior_alpha > 0.0,
            "trust.prior_alpha must be positive, got {}",
            trust.prior_alpha
        );
        ensure!(
            trust.prior_beta.is_finite() && trust.prior_beta > 0.0,
            "trust.prior_beta must be positive, got {}",
            trust.prior_beta
        );
        ensure!(
            (0.0..1.0).contains(&trust.min_trust),
            "trust.min_trust must be in [0, 1), got {}",
            trust.min_trust
        );
        ensure!(
            trust.default_half_life_days > 0.0 && trust.half_life_overrides.values().all(|d| *d > 0.0),
            "trust half-lives must be positive"
        );

        let query = &self.query;
        ensure!(
            (1..=MAX_QUERY_CHARS).contains(&query.max_query_chars),
            "query.max_query_chars must be between 1 and {}, got {}",
            MAX_QUERY_CHARS,
            query.max_query_chars
        );
        ensure!(query.max_tokens > 0, "query.max_tokens must be positive");
        ensure!(query.max_depth > 0, "query.max_depth must be positive");
        ensure!(
            (0.0..=1.0).contains(&query.fuzzy_threshold),
            "query.fuzzy_threshold must be in [0, 1], got {}",
            query.fuzzy_threshold
        );

        ensure!(
            (0.0..=1.0).contains(&self.quality.quarantine_failure_rate),
            "quality.quarantine_failure_rate must be in [0, 1], got {}",
            self.quality.quarantine_failure_rate
        );
        ensure!(
            self.retrieval.default_limit >= 1 && self.retrieval.default_limit <= self.retrieval.max_limit,
            "retrieval.default_limit must be between 1 and max_limit ({})",
            self.retrieval.max_limit
        );
        Ok(())
    }
}

/// Hard ceiling on query length, whatever the config says
pub const MAX_QUERY_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub prior_alpha: f64,
    pub prior_beta: f64,
    /// Half-life of trust decay when a type has no override
    pub default_half_life_days: f64,
    pub half_life_overrides: HashMap<PatternType, f64>,
    /// Decay never pulls the trust value below this
    pub min_trust: f64,
    pub quantile_tolerance: f64,
    pub quantile_max_iterations: usize,
    /// Above this alpha+beta the Beta CDF uses a normal approximation
    pub normal_approx_threshold: f64,
    pub wilson_cache_capacity: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            default_half_life_days: 90.0,
            half_life_overrides: HashMap::new(),
            min_trust: 0.05,
            quantile_tolerance: 1e-6,
            quantile_max_iterations: 100,
            normal_approx_threshold: 1000.0,
            wilson_cache_capacity: 10_000,
        }
    }
}

impl TrustConfig {
    pub fn half_life_for(&self, pattern_type: PatternType) -> f64 {
        self.half_life_overrides
            .get(&pattern_type)
            .copied()
            .unwrap_or(self.default_half_life_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub freshness_half_life_days: f64,
    /// Age assumed for patterns that were never reviewed
    pub missing_review_age_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            freshness_half_life_days: 90.0,
            missing_review_age_days: 365.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldWeights {
    pub title: f64,
    pub summary: f64,
    pub tags: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            title: 0.5,
            summary: 0.3,
            tags: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_query_chars: usize,
    pub max_tokens: usize,
    pub max_depth: usize,
    pub synonyms_enabled: bool,
    pub max_synonyms_per_term: usize,
    /// Leaf cap for the expanded query
    pub max_expanded_terms: usize,
    pub fuzzy_enabled: bool,
    pub fuzzy_threshold: f64,
    pub fuzzy_max_results: usize,
    pub field_weights: FieldWeights,
    pub levenshtein_cache_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_query_chars: MAX_QUERY_CHARS,
            max_tokens: 64,
            max_depth: 16,
            synonyms_enabled: true,
            max_synonyms_per_term: 3,
            max_expanded_terms: 20,
            fuzzy_enabled: true,
            fuzzy_threshold: 0.3,
            fuzzy_max_results: 50,
            field_weights: FieldWeights::default(),
            levenshtein_cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub name_similarity_threshold: f64,
    pub tag_jaccard_threshold: f64,
    pub duplicate_threshold: f64,
    /// Trust difference required before trust decides a conflict
    pub trust_margin: f64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub page_size: usize,
    /// Upper bound on counterparts examined per detection
    pub scan_limit: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            name_similarity_threshold: 0.8,
            tag_jaccard_threshold: 0.7,
            duplicate_threshold: 0.6,
            trust_margin: 0.1,
            cache_ttl_secs: 300,
            cache_capacity: 5_000,
            page_size: 100,
            scan_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub trust: f64,
    pub freshness: f64,
    pub evidence: f64,
    pub conflicts: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            trust: 0.4,
            freshness: 0.3,
            evidence: 0.2,
            conflicts: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    pub quarantine_failure_rate: f64,
    pub quarantine_min_uses: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub max_conflict_penalty: f64,
    pub page_size: usize,
    /// Upper bound on patterns examined by store-wide quality scans
    pub scan_limit: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            quarantine_failure_rate: 0.5,
            quarantine_min_uses: 10,
            cache_ttl_secs: 3_600,
            cache_capacity: 10_000,
            max_conflict_penalty: 0.8,
            page_size: 100,
            scan_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub candidate_limit: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Patterns read to build the "did you mean" dictionary on empty results
    pub suggestion_scan_limit: usize,
    pub max_suggestions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 100,
            default_limit: 10,
            max_limit: 50,
            suggestion_scan_limit: 500,
            max_suggestions: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    /// Attempts per outcome when a concurrent writer bumps the version
    pub max_version_retries: usize,
    /// Size of the best/worst lists in learning stats
    pub stats_top_n: usize,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            max_version_retries: 5,
            stats_top_n: 5,
        }
    }
}

/// Default data directory (~/.local/share/pattern-intel on Linux)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pattern-intel")
}
