//! Core types for the pattern intelligence engine
//!
//! A pattern is a reusable unit of coding knowledge: a proven solution, an
//! anti-pattern, a failure signature or a policy. Its numeric state (trust,
//! usage, evidence counters) only changes through the outcome feed.

use crate::error::{PatternError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Maximum number of top-level snippets on a pattern
pub const MAX_TOP_LEVEL_SNIPPETS: usize = 50;

/// Maximum number of children under any snippet node
pub const MAX_SNIPPET_CHILDREN: usize = 10;

/// Maximum nesting depth of the snippet tree (top level is depth 1)
pub const MAX_SNIPPET_DEPTH: usize = 4;

static PATTERN_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+):(CODEBASE|LANG|ANTI|FAILURE|POLICY|TEST|MIGRATION):([A-Za-z0-9_-]+):([A-Za-z0-9_.-]+)$",
    )
    .expect("pattern id regex is valid")
});

/// Kind of knowledge a pattern carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    Codebase,
    Lang,
    Anti,
    Failure,
    Policy,
    Test,
    Migration,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Codebase => "CODEBASE",
            PatternType::Lang => "LANG",
            PatternType::Anti => "ANTI",
            PatternType::Failure => "FAILURE",
            PatternType::Policy => "POLICY",
            PatternType::Test => "TEST",
            PatternType::Migration => "MIGRATION",
        }
    }

    pub fn all() -> [PatternType; 7] {
        [
            PatternType::Codebase,
            PatternType::Lang,
            PatternType::Anti,
            PatternType::Failure,
            PatternType::Policy,
            PatternType::Test,
            PatternType::Migration,
        ]
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        PatternType::all()
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PatternError::validation(format!("unknown pattern type '{}'", s)))
    }
}

/// Parsed form of `ORG.TEAM:TYPE:CATEGORY:NAME`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternId {
    pub org: String,
    pub team: String,
    pub pattern_type: PatternType,
    pub category: String,
    pub name: String,
}

impl PatternId {
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = PATTERN_ID_RE.captures(raw).ok_or_else(|| {
            PatternError::validation(format!(
                "pattern id '{}' does not match ORG.TEAM:TYPE:CATEGORY:NAME",
                raw
            ))
        })?;

        Ok(Self {
            org: caps[1].to_string(),
            team: caps[2].to_string(),
            pattern_type: caps[3].parse()?,
            category: caps[4].to_string(),
            name: caps[5].to_string(),
        })
    }

    /// `ORG.TEAM`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.org, self.team)
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:{}:{}:{}",
            self.org, self.team, self.pattern_type, self.category, self.name
        )
    }
}

/// A framework the pattern applies to, with an optional semver range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_range: Option<String>,
}

/// Declared applicability of a pattern
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternScope {
    pub languages: Vec<String>,
    pub frameworks: Vec<FrameworkScope>,
    /// Exact files, directories (trailing `/`) or globs
    pub paths: Vec<String>,
    /// Repository names, glob-aware (`acme/*`)
    pub repos: Vec<String>,
    pub task_types: Vec<String>,
    pub envs: Vec<String>,
}

/// Beta distribution parameters backing the trust score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustParams {
    pub alpha: f64,
    pub beta: f64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl TrustParams {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            last_updated: None,
        }
    }

    /// Mean of Beta(alpha, beta)
    pub fn value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

impl Default for TrustParams {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStats {
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageStats {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.failures as f64 / n as f64,
        }
    }

    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.successes as f64 / n as f64,
        }
    }
}

/// Where a piece of evidence lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceRef {
    GitLines {
        file: String,
        start: u32,
        end: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
    Commit {
        sha: String,
    },
    Pr {
        repo: String,
        number: u64,
    },
    Issue {
        repo: String,
        number: u64,
    },
    CiRun {
        provider: String,
        run_id: String,
    },
}

/// How an outcome was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    AutomatedTest,
    ManualVerification,
    ProductionUsage,
    CiValidation,
    DevelopmentUsage,
}

impl EvidenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::AutomatedTest => "automated_test",
            EvidenceType::ManualVerification => "manual_verification",
            EvidenceType::ProductionUsage => "production_usage",
            EvidenceType::CiValidation => "ci_validation",
            EvidenceType::DevelopmentUsage => "development_usage",
        }
    }
}

impl FromStr for EvidenceType {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "automated_test" => Ok(EvidenceType::AutomatedTest),
            "manual_verification" => Ok(EvidenceType::ManualVerification),
            "production_usage" => Ok(EvidenceType::ProductionUsage),
            "ci_validation" => Ok(EvidenceType::CiValidation),
            "development_usage" => Ok(EvidenceType::DevelopmentUsage),
            other => Err(PatternError::validation(format!(
                "unknown evidence type '{}'",
                other
            ))),
        }
    }
}

/// A code snippet, optionally nested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<EvidenceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Snippet>,
}

/// Quarantine record written when the failure rate crosses the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quarantine {
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityMetadata {
    pub overall_score: Option<f64>,
    pub cached_at: Option<DateTime<Utc>>,
    pub quarantine: Option<Quarantine>,
    /// Set by a manual refresh: auto-quarantine is suspended until an
    /// outcome newer than this arrives.
    pub quarantine_override_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Typed view over free-form pattern metadata.
///
/// Known keys are typed; anything else lands in `extensions` and is only
/// decoded when asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternMeta {
    /// Id of the pattern this one fixes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixes: Option<String>,
    /// Ids that must never be applied together with this pattern
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    /// Explicit owning org; falls back to the id namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// package -> semver range
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub semver: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl PatternMeta {
    /// Decode an opaque extension key. Missing keys are `Ok(None)`.
    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.extensions.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    PatternError::validation(format!("metadata key '{}' has wrong shape: {}", key, e))
                }),
        }
    }
}

/// A stored, reusable pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: PatternType,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub scope: PatternScope,
    #[serde(default)]
    pub trust: TrustParams,
    #[serde(default)]
    pub usage: UsageStats,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
    /// Outcome counts per evidence type
    #[serde(default)]
    pub evidence_counts: BTreeMap<EvidenceType, u64>,
    #[serde(default)]
    pub quality: QualityMetadata,
    #[serde(default)]
    pub meta: PatternMeta,
    #[serde(default)]
    pub last_reviewed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl Pattern {
    /// Minimal pattern with default trust and empty scope
    pub fn new(id: &str, title: &str, summary: &str) -> Result<Self> {
        let parsed = PatternId::parse(id)?;
        Ok(Self {
            id: id.to_string(),
            pattern_type: parsed.pattern_type,
            title: title.to_string(),
            summary: summary.to_string(),
            scope: PatternScope::default(),
            trust: TrustParams::default(),
            usage: UsageStats::default(),
            tags: Vec::new(),
            keywords: Vec::new(),
            snippets: Vec::new(),
            evidence: Vec::new(),
            evidence_counts: BTreeMap::new(),
            quality: QualityMetadata::default(),
            meta: PatternMeta::default(),
            last_reviewed: None,
            created_at: Utc::now(),
            version: 0,
        })
    }

    pub fn parsed_id(&self) -> Result<PatternId> {
        PatternId::parse(&self.id)
    }

    pub fn is_quarantined(&self) -> bool {
        self.quality.quarantine.is_some()
    }

    /// Check every structural invariant a stored pattern must hold.
    pub fn validate(&self) -> Result<()> {
        let parsed = self.parsed_id()?;
        if parsed.pattern_type != self.pattern_type {
            return Err(PatternError::validation(format!(
                "pattern {} declares type {} but its id says {}",
                self.id, self.pattern_type, parsed.pattern_type
            )));
        }

        if !(self.trust.alpha > 0.0 && self.trust.alpha.is_finite())
            || !(self.trust.beta > 0.0 && self.trust.beta.is_finite())
        {
            return Err(PatternError::validation(format!(
                "pattern {} has non-positive trust parameters ({}, {})",
                self.id, self.trust.alpha, self.trust.beta
            )));
        }

        validate_snippets(&self.snippets)
    }
}

/// Walk the snippet tree with an explicit stack, enforcing count and depth limits.
pub fn validate_snippets(snippets: &[Snippet]) -> Result<()> {
    if snippets.len() > MAX_TOP_LEVEL_SNIPPETS {
        return Err(PatternError::validation(format!(
            "{} top-level snippets exceeds limit of {}",
            snippets.len(),
            MAX_TOP_LEVEL_SNIPPETS
        )));
    }

    let mut stack: Vec<(&Snippet, usize)> = snippets.iter().map(|s| (s, 1)).collect();
    while let Some((snippet, depth)) = stack.pop() {
        if depth > MAX_SNIPPET_DEPTH {
            return Err(PatternError::validation(format!(
                "snippet nesting exceeds depth {}",
                MAX_SNIPPET_DEPTH
            )));
        }
        if snippet.children.len() > MAX_SNIPPET_CHILDREN {
            return Err(PatternError::validation(format!(
                "snippet has {} children, limit is {}",
                snippet.children.len(),
                MAX_SNIPPET_CHILDREN
            )));
        }
        stack.extend(snippet.children.iter().map(|c| (c, depth + 1)));
    }

    Ok(())
}

/// An outcome observed earlier in the caller's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorOutcome {
    pub pattern_id: String,
    pub success: bool,
}

/// Project signals that accompany a request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySignals {
    pub language: Option<String>,
    pub framework: Option<String>,
    pub framework_version: Option<String>,
    /// package -> installed version
    pub dependencies: BTreeMap<String, String>,
    pub file_paths: Vec<String>,
    pub repo: Option<String>,
    pub org: Option<String>,
    pub prior_outcomes: Vec<PriorOutcome>,
}

/// A retrieval request. Consumed by reference, never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub task: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub signals: QuerySignals,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Skip synonym expansion and fuzzy reranking
    #[serde(default)]
    pub performance_mode: bool,
}
