use crate::types::{Pattern, PatternId, QuerySignals};

/// Point budget for the locality factor
pub const LOCALITY_BUDGET: f64 = 10.0;

const SAME_REPO: f64 = 10.0;
const SAME_ORG: f64 = 5.0;

/// Same repo beats same org beats nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalityScorer;

impl LocalityScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, pattern: &Pattern, signals: &QuerySignals) -> f64 {
        if let Some(repo) = signals.repo.as_deref() {
            if pattern.scope.repos.iter().any(|declared| repo_matches(declared, repo)) {
                return SAME_REPO;
            }
        }

        if let Some(org) = signals.org.as_deref() {
            if pattern_org(pattern).is_some_and(|o| o.eq_ignore_ascii_case(org)) {
                return SAME_ORG;
            }
        }

        0.0
    }
}

fn repo_matches(declared: &str, repo: &str) -> bool {
    if declared.eq_ignore_ascii_case(repo) {
        return true;
    }
    glob::Pattern::new(declared)
        .map(|p| {
            p.matches_with(
                repo,
                glob::MatchOptions {
                    case_sensitive: false,
                    ..Default::default()
                },
            )
        })
        .unwrap_or(false)
}

/// Explicit org in metadata, else the ORG segment of the id namespace
fn pattern_org(pattern: &Pattern) -> Option<String> {
    pattern
        .meta
        .org
        .clone()
        .or_else(|| PatternId::parse(&pattern.id).ok().map(|id| id.org))
}
