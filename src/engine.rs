//! Retrieval orchestration
//!
//! One request end to end:
//!
//! ```text
//! task text ─► parse + expand ─► store search ─► fuzzy rerank ─► drop quarantined
//!           ─► score (trust/freshness/scope/locality) ─► conflict penalties ─► sort + truncate
//! ```
//!
//! A query that fails validation is rejected before anything touches the
//! store. All services are built once per engine and shared by `Arc`.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::outcome::{BatchOutcome, LearningStats, OutcomeEvent, OutcomeRecorder, OutcomeResult};
use crate::quality::{
    conflict_penalty, declared_ranges, Conflict, ConflictResolver, PatternQualityManager, QualityScore,
    SemverValidator, VersionWarning,
};
use crate::query::{QueryProcessor, Suggestion, SynonymExpander};
use crate::scoring::{compare_ranked, RankingEngine, ScoreBreakdown};
use crate::storage::{self, PatternStore};
use crate::trust::{TrustModel, TrustScore};
use crate::types::{Pattern, PatternType, QuerySignals, RetrievalRequest};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One ranked pattern with everything that went into its score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub pattern_id: String,
    pub title: String,
    pub pattern_type: PatternType,
    pub breakdown: ScoreBreakdown,
    /// Fraction removed for losing conflicts within this result set
    pub conflict_penalty: f64,
    pub final_score: f64,
    pub trust: TrustScore,
    /// Fuzzy field similarity; absent in performance mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub version_warnings: Vec<VersionWarning>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub request_id: Uuid,
    /// The emitted full-text query
    pub query: String,
    pub expanded_terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub candidates: Vec<RankedCandidate>,
    /// Patterns that matched before quarantine filtering and truncation
    pub matched: usize,
    /// "Did you mean" corrections, only when nothing matched
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

pub struct RetrievalEngine {
    config: EngineConfig,
    store: Arc<dyn PatternStore>,
    trust: Arc<TrustModel>,
    query: QueryProcessor,
    ranking: RankingEngine,
    conflicts: Arc<ConflictResolver>,
    quality: Arc<PatternQualityManager>,
    semver: SemverValidator,
    outcomes: OutcomeRecorder,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn PatternStore>, config: EngineConfig) -> Self {
        let trust = Arc::new(TrustModel::new(config.trust.clone()));
        let synonyms = match &config.synonyms {
            Some(table) => SynonymExpander::from_config(table),
            None => SynonymExpander::with_defaults(),
        };
        let query = QueryProcessor::new(&config.query, synonyms);
        let ranking = RankingEngine::new(trust.clone(), &config.scoring);
        let conflicts = Arc::new(ConflictResolver::new(&config.conflicts, query.fuzzy().clone()));
        let quality = Arc::new(PatternQualityManager::new(
            &config.quality,
            trust.clone(),
            ranking.freshness().clone(),
            conflicts.clone(),
        ));
        let outcomes = OutcomeRecorder::new(store.clone(), trust.clone(), quality.clone(), &config.outcomes);

        Self {
            config,
            store,
            trust,
            query,
            ranking,
            conflicts,
            quality,
            semver: SemverValidator::new(),
            outcomes,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievalResponse> {
        let request_id = Uuid::new_v4();
        let processed = self.query.process(&request.task, request.performance_mode)?;

        let hits = self
            .store
            .search(&processed.safe, self.config.retrieval.candidate_limit)
            .await?;
        let matched = hits.len();
        let patterns: Vec<Pattern> = hits.into_iter().map(|h| h.pattern).collect();

        let mut similarity: HashMap<String, f64> = HashMap::new();
        let patterns = if request.performance_mode {
            patterns
        } else {
            self.query
                .rerank(patterns, &processed.terms)
                .into_iter()
                .map(|r| {
                    similarity.insert(r.pattern.id.clone(), r.similarity);
                    r.pattern
                })
                .collect()
        };

        let before = patterns.len();
        let candidates: Vec<Pattern> = patterns.into_iter().filter(|p| !p.is_quarantined()).collect();
        if candidates.len() < before {
            debug!(%request_id, dropped = before - candidates.len(), "Dropped quarantined candidates");
        }

        let conflicts = self.conflicts.conflicts_among(&candidates);
        let installed = installed_versions(&request.signals);
        let now = Utc::now();

        let mut ranked: Vec<(RankedCandidate, Pattern)> = self
            .ranking
            .rank(candidates, &request.signals, now)
            .into_iter()
            .map(|scored| {
                let pattern = scored.pattern;
                let lost: Vec<Conflict> = conflicts.iter().filter(|c| c.loses(&pattern.id)).cloned().collect();
                let penalty = conflict_penalty(&lost, self.config.quality.max_conflict_penalty);

                let mut notes: Vec<String> = lost
                    .iter()
                    .map(|c| {
                        format!(
                            "{:?} conflict with {}: {}",
                            c.conflict_type,
                            c.resolution.winner_id,
                            c.resolution.reason
                        )
                    })
                    .collect();
                if request
                    .signals
                    .prior_outcomes
                    .iter()
                    .any(|o| o.pattern_id == pattern.id && !o.success)
                {
                    notes.push("failed earlier in this session".to_string());
                }

                let version_warnings = if installed.is_empty() {
                    Vec::new()
                } else {
                    self.semver
                        .check_versions(&declared_ranges(&pattern), &installed)
                        .warnings
                        .into_iter()
                        .filter(|w| !matches!(w, VersionWarning::Unknown { .. }))
                        .collect()
                };

                let candidate = RankedCandidate {
                    pattern_id: pattern.id.clone(),
                    title: pattern.title.clone(),
                    pattern_type: pattern.pattern_type,
                    breakdown: scored.breakdown,
                    conflict_penalty: penalty,
                    final_score: scored.score * (1.0 - penalty),
                    trust: self.trust.score_pattern(&pattern),
                    similarity: similarity.get(&pattern.id).copied(),
                    version_warnings,
                    notes,
                };
                (candidate, pattern)
            })
            .collect();

        ranked.sort_by(|(ca, pa), (cb, pb)| compare_ranked(ca.final_score, pa, cb.final_score, pb));
        let limit = request
            .limit
            .unwrap_or(self.config.retrieval.default_limit)
            .clamp(1, self.config.retrieval.max_limit.max(1));
        ranked.truncate(limit);

        let suggestions = if matched == 0 {
            self.suggestions(&processed.terms).await?
        } else {
            Vec::new()
        };

        let expanded_terms = processed
            .expansion
            .as_ref()
            .map(|e| e.terms.clone())
            .unwrap_or_else(|| processed.terms.clone());

        info!(
            %request_id,
            matched,
            returned = ranked.len(),
            conflicts = conflicts.len(),
            "Retrieval complete"
        );

        Ok(RetrievalResponse {
            request_id,
            query: processed.safe.to_string(),
            expanded_terms,
            intent: request.intent.clone(),
            candidates: ranked.into_iter().map(|(c, _)| c).collect(),
            matched,
            suggestions,
        })
    }

    /// Corrections for query terms, drawn from a bounded scan of titles, tags and keywords
    async fn suggestions(&self, terms: &[String]) -> Result<Vec<Suggestion>> {
        let limits = &self.config.retrieval;
        if terms.is_empty() || limits.max_suggestions == 0 {
            return Ok(Vec::new());
        }

        let patterns = storage::scan(
            self.store.as_ref(),
            self.config.quality.page_size,
            limits.suggestion_scan_limit,
        )
        .await?;

        let mut dictionary: BTreeSet<String> = BTreeSet::new();
        for p in &patterns {
            let words = p
                .title
                .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
                .chain(p.tags.iter().map(String::as_str))
                .chain(p.keywords.iter().map(String::as_str));
            dictionary.extend(words.filter(|w| w.len() > 2).map(str::to_lowercase));
        }
        let dictionary: Vec<String> = dictionary.into_iter().collect();

        let mut out: Vec<Suggestion> = Vec::new();
        for term in terms {
            for suggestion in self.query.suggest_corrections(term, &dictionary, limits.max_suggestions) {
                if !out.iter().any(|s| s.term == suggestion.term) {
                    out.push(suggestion);
                }
            }
        }
        out.truncate(limits.max_suggestions);
        Ok(out)
    }

    pub async fn record_outcome(&self, event: &OutcomeEvent) -> Result<OutcomeResult> {
        self.outcomes.record(event).await
    }

    pub async fn record_outcomes_batch(&self, events: Vec<OutcomeEvent>) -> BatchOutcome {
        self.outcomes.record_batch(events).await
    }

    pub async fn assess_quality(&self, id: &str) -> Result<QualityScore> {
        self.quality.assess(self.store.as_ref(), id).await
    }

    pub async fn refresh_pattern(&self, id: &str) -> Result<QualityScore> {
        self.quality.refresh_pattern(self.store.as_ref(), id).await
    }

    pub async fn detect_conflicts(&self, id: &str) -> Result<Vec<Conflict>> {
        self.conflicts.detect_conflicts(self.store.as_ref(), id).await
    }

    pub async fn quarantined(&self) -> Result<Vec<Pattern>> {
        self.quality.quarantined(self.store.as_ref()).await
    }

    pub async fn learning_stats(&self) -> Result<LearningStats> {
        self.outcomes.learning_stats().await
    }
}

/// Dependencies plus the primary framework, keyed by lowercase name
fn installed_versions(signals: &QuerySignals) -> BTreeMap<String, String> {
    let mut installed: BTreeMap<String, String> = signals
        .dependencies
        .iter()
        .map(|(name, version)| (name.to_lowercase(), version.clone()))
        .collect();
    if let (Some(framework), Some(version)) = (&signals.framework, &signals.framework_version) {
        installed
            .entry(framework.to_lowercase())
            .or_insert_with(|| version.clone());
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatternError;
    use crate::storage::MemoryStore;
    use crate::types::{EvidenceType, PriorOutcome, Quarantine};

    async fn engine_with(patterns: Vec<Pattern>, config: EngineConfig) -> RetrievalEngine {
        let store = Arc::new(MemoryStore::new());
        for p in &patterns {
            store.upsert(p, None).await.unwrap();
        }
        RetrievalEngine::new(store, config)
    }

    fn pattern(id: &str, title: &str, summary: &str) -> Pattern {
        Pattern::new(id, title, summary).unwrap()
    }

    fn request(task: &str) -> RetrievalRequest {
        RetrievalRequest {
            task: task.to_string(),
            performance_mode: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scope_match_ranks_first() {
        let generic = pattern("acme.web:LANG:http:retry", "Retry loop", "Generic retry helper");
        let mut scoped = pattern(
            "acme.web:CODEBASE:http:backoff",
            "Retry with jitter",
            "Exponential backoff for the billing client",
        );
        scoped.scope.languages = vec!["rust".to_string()];
        scoped.scope.paths = vec!["src/billing/".to_string()];

        let engine = engine_with(vec![generic, scoped], EngineConfig::default()).await;
        let mut req = request("retry");
        req.signals.language = Some("rust".to_string());
        req.signals.file_paths = vec!["src/billing/client.rs".to_string()];

        let response = engine.retrieve(&req).await.unwrap();
        assert_eq!(response.request_id.get_version_num(), 4);
        assert_eq!(response.matched, 2);
        assert_eq!(response.candidates[0].pattern_id, "acme.web:CODEBASE:http:backoff");
        assert!(response.candidates[0].breakdown.scope > response.candidates[1].breakdown.scope);
        assert!(response.candidates[0].similarity.is_none());
        for c in &response.candidates {
            assert!(c.final_score <= 100.0);
            assert_eq!(c.conflict_penalty, 0.0);
        }
    }

    #[tokio::test]
    async fn test_expansion_reaches_synonym_only_pattern() {
        let mut config = EngineConfig::default();
        config.synonyms = Some(BTreeMap::from([(
            "auth".to_string(),
            vec!["authentication".to_string()],
        )]));
        config.query.fuzzy_threshold = 0.0;
        let engine = engine_with(
            vec![pattern(
                "acme.web:CODEBASE:security:middleware",
                "Authentication middleware",
                "Verify bearer tokens",
            )],
            config,
        )
        .await;

        let fast = engine.retrieve(&request("auth")).await.unwrap();
        assert!(fast.candidates.is_empty());

        let mut req = request("auth");
        req.performance_mode = false;
        let response = engine.retrieve(&req).await.unwrap();
        assert_eq!(response.candidates.len(), 1);
        assert!(response.expanded_terms.contains(&"authentication".to_string()));
        assert!(response.query.contains("\"authentication\""));
        assert!(response.candidates[0].similarity.is_some());
    }

    #[tokio::test]
    async fn test_quarantined_patterns_are_dropped() {
        let ok = pattern("acme.web:LANG:cache:ttl", "Cache with TTL", "Expire entries");
        let mut bad = pattern("acme.web:LANG:cache:forever", "Cache forever", "Never expire");
        bad.quality.quarantine = Some(Quarantine {
            reason: "failing".to_string(),
            quarantined_at: Utc::now(),
            failure_rate: 0.9,
        });

        let engine = engine_with(vec![ok, bad], EngineConfig::default()).await;
        let response = engine.retrieve(&request("cache")).await.unwrap();
        assert_eq!(response.matched, 2);
        assert_eq!(response.candidates.len(), 1);
        assert_eq!(response.candidates[0].pattern_id, "acme.web:LANG:cache:ttl");
    }

    #[tokio::test]
    async fn test_conflict_loser_is_penalized() {
        let policy = pattern("acme.web:POLICY:http:timeouts", "Timeouts required", "Every call sets a deadline");
        let mut loser = pattern("acme.web:CODEBASE:http:no-timeouts", "Timeouts disabled", "Long polling client");
        loser.meta.excludes = vec![policy.id.clone()];

        let engine = engine_with(vec![policy, loser], EngineConfig::default()).await;
        let response = engine.retrieve(&request("timeouts")).await.unwrap();

        let losing = response
            .candidates
            .iter()
            .find(|c| c.pattern_id == "acme.web:CODEBASE:http:no-timeouts")
            .unwrap();
        assert_eq!(losing.conflict_penalty, 0.5);
        assert!((losing.final_score - losing.breakdown.total() * 0.5).abs() < 1e-9);
        assert!(losing.notes[0].contains("acme.web:POLICY:http:timeouts"));
        assert_eq!(response.candidates[0].pattern_id, "acme.web:POLICY:http:timeouts");
    }

    #[tokio::test]
    async fn test_unsafe_query_is_rejected() {
        let engine = engine_with(vec![], EngineConfig::default()).await;
        let err = engine.retrieve(&request("retry; DROP TABLE patterns")).await.unwrap_err();
        assert!(matches!(err, PatternError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_empty_results_offer_suggestions() {
        let mut p = pattern("acme.web:CODEBASE:security:login", "Login flow", "Session handling");
        p.tags = vec!["authentication".to_string()];
        let engine = engine_with(vec![p], EngineConfig::default()).await;

        let response = engine.retrieve(&request("authentcation")).await.unwrap();
        assert!(response.candidates.is_empty());
        assert_eq!(response.suggestions[0].term, "authentication");
    }

    #[tokio::test]
    async fn test_notes_and_version_warnings() {
        let mut p = pattern("acme.web:CODEBASE:ui:hooks", "Hooks data loading", "Fetch in effects");
        p.meta.semver.insert("react".to_string(), "^17.0.0".to_string());
        let engine = engine_with(vec![p], EngineConfig::default()).await;

        let mut req = request("hooks");
        req.signals.dependencies.insert("react".to_string(), "18.2.0".to_string());
        req.signals.prior_outcomes.push(PriorOutcome {
            pattern_id: "acme.web:CODEBASE:ui:hooks".to_string(),
            success: false,
        });

        let response = engine.retrieve(&req).await.unwrap();
        let c = &response.candidates[0];
        assert!(matches!(c.version_warnings[0], VersionWarning::Mismatch { .. }));
        assert!(c.notes.iter().any(|n| n.contains("earlier in this session")));
    }

    #[tokio::test]
    async fn test_limit_is_applied() {
        let patterns = (0..5)
            .map(|i| {
                pattern(
                    &format!("acme.web:LANG:queue:worker{}", i),
                    &format!("Queue worker variant{}", i),
                    &format!("Consumer number{}", i),
                )
            })
            .collect();
        let engine = engine_with(patterns, EngineConfig::default()).await;

        let mut req = request("queue");
        req.limit = Some(2);
        assert_eq!(engine.retrieve(&req).await.unwrap().candidates.len(), 2);

        req.limit = Some(0);
        assert_eq!(engine.retrieve(&req).await.unwrap().candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_outcomes_flow_into_quality() {
        let id = "acme.web:CODEBASE:db:pool";
        let engine = engine_with(
            vec![pattern(id, "Connection pool", "Reuse connections")],
            EngineConfig::default(),
        )
        .await;

        let before = engine.assess_quality(id).await.unwrap();
        let events = (0..5)
            .map(|_| OutcomeEvent::new(id, true, EvidenceType::ProductionUsage))
            .collect();
        let batch = engine.record_outcomes_batch(events).await;
        assert_eq!(batch.succeeded, 5);

        let after = engine.assess_quality(id).await.unwrap();
        assert!(after.trust > before.trust);
        assert!(after.promotion.is_approved() || after.evidence.overall > before.evidence.overall);

        let stats = engine.learning_stats().await.unwrap();
        assert_eq!(stats.total_successes, 5);
        assert!(engine.detect_conflicts(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expanded_retrieval_over_sqlite() {
        let store = Arc::new(crate::storage::SqliteStore::open_in_memory().unwrap());
        store
            .upsert(
                &pattern("acme.web:LANG:auth:jwt", "JWT auth", "Sign and verify auth tokens"),
                None,
            )
            .await
            .unwrap();
        let mut config = EngineConfig::default();
        config.query.fuzzy_threshold = 0.0;
        let engine = RetrievalEngine::new(store, config);

        for fast in [true, false] {
            let mut req = request("auth jwt");
            req.performance_mode = fast;
            let response = engine.retrieve(&req).await.unwrap();
            assert_eq!(response.candidates.len(), 1, "performance_mode={}", fast);
            assert_eq!(response.candidates[0].pattern_id, "acme.web:LANG:auth:jwt");
        }
    }
}
