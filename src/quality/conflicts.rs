//! Conflict detection and resolution
//!
//! Two patterns conflict when applying both would be wrong or wasteful.
//! Checked in severity order, the first hit wins:
//!
//! | Type                    | Severity | Trigger |
//! |-------------------------|----------|---------|
//! | mutual_exclusion        | critical | explicit `excludes`, or a fix for the other pattern in the same namespace |
//! | version_incompatible    | high     | a shared package with non-intersecting ranges |
//! | duplicate_functionality | medium   | title+summary token Jaccard at or above threshold |
//! | overlapping_scope       | low      | same type and category with similar names, or tag Jaccard above threshold |
//!
//! Resolution cascade: POLICY beats everything, then higher trust (beyond a
//! margin), then more specific, then newer, then the lower id. Everything is
//! evaluated on the id-ordered pair, so argument order never matters.

use super::cache::GuardedCache;
use super::semver::SemverValidator;
use crate::config::ConflictConfig;
use crate::error::Result;
use crate::query::FuzzyMatcher;
use crate::storage::{self, PatternStore};
use crate::types::{Pattern, PatternId, PatternType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Id segments that say nothing about where a pattern applies
const GENERIC_SEGMENTS: [&str; 6] = ["default", "general", "common", "shared", "global", "any"];

const STOP_WORDS: [&str; 10] = ["the", "a", "an", "and", "or", "of", "to", "for", "in", "with"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    MutualExclusion,
    VersionIncompatible,
    DuplicateFunctionality,
    OverlappingScope,
}

impl ConflictType {
    pub fn severity(&self) -> Severity {
        match self {
            ConflictType::MutualExclusion => Severity::Critical,
            ConflictType::VersionIncompatible => Severity::High,
            ConflictType::DuplicateFunctionality => Severity::Medium,
            ConflictType::OverlappingScope => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution to the conflict penalty
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Critical => 0.5,
            Severity::High => 0.3,
            Severity::Medium => 0.15,
            Severity::Low => 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    PolicyPrecedence,
    HigherTrust,
    MoreSpecific,
    Newest,
    IdOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner_id: String,
    pub loser_id: String,
    pub rule: ResolutionRule,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Lower id of the pair
    pub pattern_a: String,
    pub pattern_b: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub details: String,
    pub resolution: Resolution,
}

impl Conflict {
    pub fn involves(&self, id: &str) -> bool {
        self.pattern_a == id || self.pattern_b == id
    }

    pub fn other(&self, id: &str) -> &str {
        if self.pattern_a == id {
            &self.pattern_b
        } else {
            &self.pattern_a
        }
    }

    pub fn loses(&self, id: &str) -> bool {
        self.resolution.loser_id == id
    }
}

/// Sum of severity weights, capped
pub fn conflict_penalty(conflicts: &[Conflict], cap: f64) -> f64 {
    conflicts
        .iter()
        .map(|c| c.severity.weight())
        .sum::<f64>()
        .min(cap)
}

pub struct ConflictResolver {
    config: ConflictConfig,
    fuzzy: Arc<FuzzyMatcher>,
    semver: SemverValidator,
    cache: GuardedCache<Arc<Vec<Conflict>>>,
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig, fuzzy: Arc<FuzzyMatcher>) -> Self {
        let cache = GuardedCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_secs));
        Self {
            config: config.clone(),
            fuzzy,
            semver: SemverValidator::new(),
            cache,
        }
    }

    /// Every conflict between `id` and the rest of the store.
    ///
    /// Scans page by page up to the configured limit. Counterparts that fail
    /// validation are logged and skipped.
    pub async fn detect_conflicts(&self, store: &dyn PatternStore, id: &str) -> Result<Vec<Conflict>> {
        if let Some(hit) = self.cache.get(id) {
            return Ok((*hit).clone());
        }

        let ticket = self.cache.ticket(id);
        let pattern = storage::require(store, id).await?;
        let others = storage::scan(store, self.config.page_size, self.config.scan_limit).await?;
        debug!(id, scanned = others.len(), "Conflict scan");

        let mut conflicts = Vec::new();
        for other in &others {
            if other.id == pattern.id {
                continue;
            }
            if let Err(e) = other.validate() {
                warn!(id = %other.id, error = %e, "Skipping malformed pattern in conflict scan");
                continue;
            }
            if let Some(conflict) = self.detect_pair(&pattern, other) {
                conflicts.push(conflict);
            }
        }

        if !self.cache.insert(id, ticket, Arc::new(conflicts.clone())) {
            debug!(id, "Patterns changed during conflict scan, not caching");
        }
        Ok(conflicts)
    }

    /// Conflicts among an in-memory candidate set
    pub fn conflicts_among(&self, patterns: &[Pattern]) -> Vec<Conflict> {
        let mut out = Vec::new();
        for (i, a) in patterns.iter().enumerate() {
            for b in &patterns[i + 1..] {
                if let Some(conflict) = self.detect_pair(a, b) {
                    out.push(conflict);
                }
            }
        }
        out
    }

    pub fn detect_pair(&self, a: &Pattern, b: &Pattern) -> Option<Conflict> {
        if a.id == b.id {
            return None;
        }
        let (a, b) = ordered(a, b);
        let (conflict_type, details) = self.classify(a, b)?;
        Some(Conflict {
            pattern_a: a.id.clone(),
            pattern_b: b.id.clone(),
            severity: conflict_type.severity(),
            conflict_type,
            details,
            resolution: self.resolve(a, b),
        })
    }

    fn classify(&self, a: &Pattern, b: &Pattern) -> Option<(ConflictType, String)> {
        if let Some(details) = mutual_exclusion(a, b) {
            return Some((ConflictType::MutualExclusion, details));
        }

        let compatibility = self.semver.check_pattern_compatibility(a, b);
        if !compatibility.is_compatible() {
            let packages: Vec<String> = compatibility
                .incompatibilities
                .iter()
                .map(|i| format!("{} ({} vs {})", i.package, i.left, i.right))
                .collect();
            return Some((
                ConflictType::VersionIncompatible,
                format!("no shared version for {}", packages.join(", ")),
            ));
        }

        let text_overlap = jaccard(&content_tokens(a), &content_tokens(b));
        if text_overlap >= self.config.duplicate_threshold {
            return Some((
                ConflictType::DuplicateFunctionality,
                format!("title and summary overlap {:.2}", text_overlap),
            ));
        }

        // Scope overlap stays one type whether it came from names or tags
        if let (Ok(ia), Ok(ib)) = (a.parsed_id(), b.parsed_id()) {
            if ia.pattern_type == ib.pattern_type && ia.category.eq_ignore_ascii_case(&ib.category) {
                let similarity = self
                    .fuzzy
                    .similarity(&ia.name.to_lowercase(), &ib.name.to_lowercase());
                if similarity >= self.config.name_similarity_threshold {
                    return Some((
                        ConflictType::OverlappingScope,
                        format!("same {}:{} with similar names ({:.2})", ia.pattern_type, ia.category, similarity),
                    ));
                }
            }
        }

        let tags_a: HashSet<String> = a.tags.iter().map(|t| t.to_lowercase()).collect();
        let tags_b: HashSet<String> = b.tags.iter().map(|t| t.to_lowercase()).collect();
        let tag_overlap = jaccard(&tags_a, &tags_b);
        if tag_overlap > self.config.tag_jaccard_threshold {
            return Some((
                ConflictType::OverlappingScope,
                format!("tag overlap {:.2}", tag_overlap),
            ));
        }

        None
    }

    /// Pick a winner. Symmetric in its arguments.
    pub fn resolve(&self, a: &Pattern, b: &Pattern) -> Resolution {
        let (a, b) = ordered(a, b);
        let decided = |winner: &Pattern, rule: ResolutionRule, reason: String| {
            let loser = if winner.id == a.id { b } else { a };
            Resolution {
                winner_id: winner.id.clone(),
                loser_id: loser.id.clone(),
                rule,
                reason,
            }
        };

        let a_policy = a.pattern_type == PatternType::Policy;
        let b_policy = b.pattern_type == PatternType::Policy;
        if a_policy != b_policy {
            let winner = if a_policy { a } else { b };
            return decided(winner, ResolutionRule::PolicyPrecedence, "policy patterns take precedence".to_string());
        }

        let (ta, tb) = (a.trust.value(), b.trust.value());
        if (ta - tb).abs() > self.config.trust_margin {
            let winner = if ta > tb { a } else { b };
            return decided(
                winner,
                ResolutionRule::HigherTrust,
                format!("trust {:.3} vs {:.3}", ta.max(tb), ta.min(tb)),
            );
        }

        let (sa, sb) = (specificity(a), specificity(b));
        if (sa - sb).abs() > f64::EPSILON {
            let winner = if sa > sb { a } else { b };
            return decided(
                winner,
                ResolutionRule::MoreSpecific,
                format!("specificity {:.1} vs {:.1}", sa.max(sb), sa.min(sb)),
            );
        }

        if a.created_at != b.created_at {
            let winner = if a.created_at > b.created_at { a } else { b };
            return decided(winner, ResolutionRule::Newest, format!("created {}", winner.created_at.to_rfc3339()));
        }

        decided(a, ResolutionRule::IdOrder, "lower id wins the final tie".to_string())
    }

    /// Drop cached conflict lists that mention `id`.
    ///
    /// Scans still running may have read the old `id`, so none of them is
    /// cached.
    pub fn invalidate(&self, id: &str) {
        self.cache.discard_in_flight();
        self.cache.invalidate(id);
        for (key, conflicts) in self.cache.iter() {
            if conflicts.iter().any(|c| c.involves(id)) {
                self.cache.invalidate(key.as_str());
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

fn ordered<'a>(a: &'a Pattern, b: &'a Pattern) -> (&'a Pattern, &'a Pattern) {
    if a.id <= b.id {
        (a, b)
    } else {
        (b, a)
    }
}

fn mutual_exclusion(a: &Pattern, b: &Pattern) -> Option<String> {
    if a.meta.excludes.iter().any(|x| *x == b.id) {
        return Some(format!("{} excludes {}", a.id, b.id));
    }
    if b.meta.excludes.iter().any(|x| *x == a.id) {
        return Some(format!("{} excludes {}", b.id, a.id));
    }

    let same_namespace = match (PatternId::parse(&a.id), PatternId::parse(&b.id)) {
        (Ok(ia), Ok(ib)) => ia.namespace() == ib.namespace(),
        _ => false,
    };
    if same_namespace {
        if a.meta.fixes.as_deref() == Some(b.id.as_str()) {
            return Some(format!("{} is a fix for {}", a.id, b.id));
        }
        if b.meta.fixes.as_deref() == Some(a.id.as_str()) {
            return Some(format!("{} is a fix for {}", b.id, a.id));
        }
    }
    None
}

/// Non-generic org/team/category segments plus a small bonus per tag
fn specificity(pattern: &Pattern) -> f64 {
    let segments = match pattern.parsed_id() {
        Ok(id) => [id.org, id.team, id.category]
            .iter()
            .filter(|s| !GENERIC_SEGMENTS.contains(&s.to_lowercase().as_str()))
            .count() as f64,
        Err(_) => 0.0,
    };
    segments + 0.1 * pattern.tags.len().min(10) as f64
}

fn content_tokens(pattern: &Pattern) -> HashSet<String> {
    format!("{} {}", pattern.title, pattern.summary)
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{FrameworkScope, TrustParams};
    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(&ConflictConfig::default(), Arc::new(FuzzyMatcher::default()))
    }

    fn pattern(id: &str, title: &str, summary: &str) -> Pattern {
        Pattern::new(id, title, summary).unwrap()
    }

    #[test]
    fn test_policy_beats_trusted_codebase_pattern() {
        let policy = pattern("acme.web:POLICY:auth:no-local-jwt", "Use the SSO gateway", "Policy");
        let mut codebase = pattern("acme.web:CODEBASE:auth:local-jwt", "Local JWT", "Codebase");
        codebase.trust = TrustParams::new(90.0, 2.0);

        let resolution = resolver().resolve(&codebase, &policy);
        assert_eq!(resolution.winner_id, policy.id);
        assert_eq!(resolution.rule, ResolutionRule::PolicyPrecedence);
    }

    #[test]
    fn test_higher_trust_beyond_margin() {
        let mut a = pattern("acme.web:LANG:http:retry-a", "A", "A");
        let mut b = pattern("acme.web:LANG:http:retry-b", "B", "B");
        a.trust = TrustParams::new(2.0, 8.0);
        b.trust = TrustParams::new(8.0, 2.0);
        let r = resolver().resolve(&a, &b);
        assert_eq!(r.winner_id, b.id);
        assert_eq!(r.rule, ResolutionRule::HigherTrust);

        // within the margin, trust does not decide
        b.trust = TrustParams::new(2.2, 7.8);
        assert_ne!(resolver().resolve(&a, &b).rule, ResolutionRule::HigherTrust);
    }

    #[test]
    fn test_more_specific_wins() {
        let generic = pattern("default.shared:LANG:common:retry", "Retry", "Retry");
        let specific = pattern("acme.web:LANG:http:retry", "Retry", "Retry");
        let r = resolver().resolve(&generic, &specific);
        assert_eq!(r.winner_id, specific.id);
        assert_eq!(r.rule, ResolutionRule::MoreSpecific);
    }

    #[test]
    fn test_newest_then_id_order() {
        let now = Utc::now();
        let mut a = pattern("acme.web:LANG:http:a", "A", "A");
        let mut b = pattern("acme.web:LANG:http:b", "B", "B");
        a.created_at = now;
        b.created_at = now - ChronoDuration::days(3);
        let r = resolver().resolve(&b, &a);
        assert_eq!(r.winner_id, a.id);
        assert_eq!(r.rule, ResolutionRule::Newest);

        b.created_at = now;
        let r = resolver().resolve(&b, &a);
        assert_eq!(r.winner_id, a.id);
        assert_eq!(r.rule, ResolutionRule::IdOrder);
    }

    #[test]
    fn test_same_tags_equal_trust_resolution_table() {
        let now = Utc::now();
        let tagged = |id: &str, title: &str, age_days: i64| {
            let mut p = pattern(id, title, title);
            p.tags = vec!["auth".to_string(), "jwt".to_string(), "security".to_string()];
            p.created_at = now - ChronoDuration::days(age_days);
            p
        };
        let cases = [
            // generic team loses on specificity even though it is newer
            (
                tagged("acme.web:LANG:auth:jwt-rotate", "Rotate signing keys", 30),
                tagged("acme.shared:LANG:auth:jwt-refresh", "Refresh tokens early", 1),
                ResolutionRule::MoreSpecific,
                "acme.web:LANG:auth:jwt-rotate",
            ),
            (
                tagged("acme.web:LANG:general:session-store", "Server side sessions", 1),
                tagged("acme.web:LANG:auth:cookie-flags", "Harden cookie flags", 30),
                ResolutionRule::MoreSpecific,
                "acme.web:LANG:auth:cookie-flags",
            ),
            (
                tagged("acme.web:LANG:auth:jwt-legacy", "Long lived tokens", 90),
                tagged("acme.web:LANG:auth:jwt-short", "Short lived tokens", 2),
                ResolutionRule::Newest,
                "acme.web:LANG:auth:jwt-short",
            ),
            (
                tagged("acme.api:LANG:auth:opaque", "Opaque access tokens", 5),
                tagged("acme.web:LANG:auth:bearer", "Bearer header parsing", 40),
                ResolutionRule::Newest,
                "acme.api:LANG:auth:opaque",
            ),
        ];

        let resolver = resolver();
        for (a, b, rule, winner) in &cases {
            for (x, y) in [(a, b), (b, a)] {
                let conflict = resolver.detect_pair(x, y).unwrap();
                assert_eq!(conflict.conflict_type, ConflictType::OverlappingScope, "{} vs {}", x.id, y.id);
                assert_eq!(conflict.resolution.rule, *rule, "{} vs {}", x.id, y.id);
                assert_eq!(conflict.resolution.winner_id, *winner, "{} vs {}", x.id, y.id);
                assert_eq!(resolver.resolve(x, y), conflict.resolution);
            }
        }
    }

    #[test]
    fn test_mutual_exclusion_by_fix_requires_same_namespace() {
        let broken = pattern("acme.web:CODEBASE:auth:token-cache", "Token cache", "Caches tokens");
        let mut fix = pattern("acme.web:FAILURE:auth:token-cache-leak", "Leak fix", "Evict on logout");
        fix.meta.fixes = Some(broken.id.clone());
        let c = resolver().detect_pair(&broken, &fix).unwrap();
        assert_eq!(c.conflict_type, ConflictType::MutualExclusion);
        assert_eq!(c.severity, Severity::Critical);

        let mut foreign = pattern("acme.api:FAILURE:auth:token-cache-leak", "Leak fix", "Evict on logout");
        foreign.meta.fixes = Some(broken.id.clone());
        assert!(resolver().detect_pair(&broken, &foreign).is_none());
    }

    #[test]
    fn test_version_incompatibility() {
        let mut a = pattern("acme.web:LANG:react:class-lifecycle", "Lifecycle", "componentWillMount");
        let mut b = pattern("acme.web:LANG:react:suspense", "Suspense", "Data fetching");
        a.scope.frameworks.push(FrameworkScope {
            name: "react".to_string(),
            version_range: Some("<16.3".to_string()),
        });
        b.scope.frameworks.push(FrameworkScope {
            name: "react".to_string(),
            version_range: Some("^18".to_string()),
        });
        let c = resolver().detect_pair(&a, &b).unwrap();
        assert_eq!(c.conflict_type, ConflictType::VersionIncompatible);
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let a = pattern("acme.web:LANG:http:retry-backoff", "Retry with exponential backoff", "Retry failed calls");
        let b = pattern("acme.api:LANG:net:backoff", "Exponential backoff retry", "Retry failed requests");
        let c = resolver().detect_pair(&a, &b).unwrap();
        assert_eq!(c.conflict_type, ConflictType::DuplicateFunctionality);

        let x = pattern("acme.web:LANG:http:retry-policy", "X", "first");
        let y = pattern("acme.web:LANG:http:retry-policy2", "Y", "second");
        let c = resolver().detect_pair(&x, &y).unwrap();
        assert_eq!(c.conflict_type, ConflictType::OverlappingScope);
        assert_eq!(c.severity, Severity::Low);

        let mut t1 = pattern("acme.web:LANG:db:pool", "P", "one");
        let mut t2 = pattern("acme.web:TEST:ci:fixtures", "Q", "two");
        t1.tags = vec!["db".into(), "postgres".into(), "pool".into(), "sqlx".into()];
        t2.tags = vec!["db".into(), "postgres".into(), "pool".into(), "sqlx".into(), "x".into()];
        assert_eq!(resolver().detect_pair(&t1, &t2).unwrap().conflict_type, ConflictType::OverlappingScope);
    }

    #[test]
    fn test_penalty_is_capped() {
        let broken = pattern("acme.web:CODEBASE:auth:a", "A", "A");
        let mut fix = pattern("acme.web:FAILURE:auth:b", "B", "B");
        fix.meta.excludes = vec![broken.id.clone()];
        let c = resolver().detect_pair(&broken, &fix).unwrap();
        let conflicts = vec![c.clone(), c.clone(), c];
        assert!((conflict_penalty(&conflicts, 0.8) - 0.8).abs() < 1e-12);
        assert!((conflict_penalty(&conflicts[..1], 0.8) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_detect_conflicts_scans_store_and_caches() {
        let store = MemoryStore::new();
        let a = pattern("acme.web:LANG:http:retry-policy", "X", "first");
        let b = pattern("acme.web:LANG:http:retry-policy2", "Y", "second");
        let c = pattern("acme.web:LANG:misc:logging", "Logging", "Structured");
        let mut broken = pattern("acme.web:LANG:http:retry-polic", "Z", "third");
        broken.trust = TrustParams::new(-1.0, 1.0);
        for p in [&a, &b, &c, &broken] {
            store.upsert(p, None).await.unwrap();
        }

        let r = resolver();
        let conflicts = r.detect_conflicts(&store, &a.id).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].other(&a.id), b.id);

        // cached until invalidated
        store.upsert(&pattern("acme.web:LANG:http:retry-policyy", "W", "fourth"), None).await.unwrap();
        assert_eq!(r.detect_conflicts(&store, &a.id).await.unwrap().len(), 1);
        r.invalidate(&b.id);
        assert_eq!(r.detect_conflicts(&store, &a.id).await.unwrap().len(), 2);
    }

    prop_compose! {
        fn arb_pattern(name: &'static str)(
            policy in any::<bool>(),
            alpha in 0.5f64..50.0,
            beta in 0.5f64..50.0,
            age in 0i64..30,
            tags in 0usize..4,
        ) -> Pattern {
            let kind = if policy { "POLICY" } else { "LANG" };
            let mut p = Pattern::new(&format!("acme.web:{}:http:{}", kind, name), "Retry", "Retry calls").unwrap();
            p.trust = TrustParams::new(alpha, beta);
            p.created_at = Utc::now() - ChronoDuration::days(age);
            p.tags = (0..tags).map(|i| format!("t{}", i)).collect();
            p
        }
    }

    proptest! {
        #[test]
        fn resolution_is_order_independent(a in arb_pattern("one"), b in arb_pattern("two")) {
            let r = resolver();
            let ab = r.resolve(&a, &b);
            let ba = r.resolve(&b, &a);
            prop_assert_eq!(&ab, &ba);
            prop_assert!(ab.winner_id == a.id || ab.winner_id == b.id);
            prop_assert_ne!(&ab.winner_id, &ab.loser_id);
        }

        #[test]
        fn policy_always_wins_against_non_policy(a in arb_pattern("one"), b in arb_pattern("two")) {
            prop_assume!((a.pattern_type == PatternType::Policy) != (b.pattern_type == PatternType::Policy));
            let winner = resolver().resolve(&a, &b).winner_id;
            let policy_id = if a.pattern_type == PatternType::Policy { &a.id } else { &b.id };
            prop_assert_eq!(&winner, policy_id);
        }
    }
}
