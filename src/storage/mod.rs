//! Storage collaborators
//!
//! The engine never owns persistence. It talks to a [`PatternStore`]:
//! point reads, paged listing, versioned writes and full-text search. The
//! search primitive only accepts a [`SafeFtsQuery`], so raw user text can
//! never reach the index.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] for tests and embedding
//! - [`SqliteStore`] backed by SQLite + FTS5

pub mod sqlite;

use crate::error::{PatternError, Result};
use crate::query::{QueryNode, SafeFtsQuery};
use crate::types::Pattern;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::warn;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub pattern: Pattern,
    /// Higher is more relevant; only comparable within one result set
    pub relevance: f64,
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Pattern>>;

    /// Patterns in ascending id order
    async fn list(&self, page: Page) -> Result<Vec<Pattern>>;

    /// Write a pattern and return its new version.
    ///
    /// With `expected_version`, the write only lands if the stored version
    /// still matches (0 for a pattern that does not exist yet); otherwise
    /// it fails with [`PatternError::VersionConflict`].
    async fn upsert(&self, pattern: &Pattern, expected_version: Option<u64>) -> Result<u64>;

    async fn search(&self, query: &SafeFtsQuery, limit: usize) -> Result<Vec<SearchHit>>;
}

/// `get` that treats a missing pattern as an error
pub async fn require(store: &dyn PatternStore, id: &str) -> Result<Pattern> {
    store.get(id).await?.ok_or_else(|| PatternError::not_found(id))
}

/// Read up to `max` patterns page by page
pub async fn scan(store: &dyn PatternStore, page_size: usize, max: usize) -> Result<Vec<Pattern>> {
    let page_size = page_size.max(1);
    let mut out = Vec::new();
    let mut offset = 0;

    while out.len() < max {
        let want = page_size.min(max - out.len());
        let page = store.list(Page::new(offset, want)).await?;
        let fetched = page.len();
        out.extend(page);
        if fetched < want {
            break;
        }
        offset += fetched;
    }

    Ok(out)
}

/// In-process store. Search evaluates the query AST directly.
#[derive(Default)]
pub struct MemoryStore {
    patterns: RwLock<BTreeMap<String, Pattern>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.patterns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.patterns.read().await.is_empty()
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Pattern>> {
        Ok(self.patterns.read().await.get(id).cloned())
    }

    async fn list(&self, page: Page) -> Result<Vec<Pattern>> {
        Ok(self
            .patterns
            .read()
            .await
            .values()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn upsert(&self, pattern: &Pattern, expected_version: Option<u64>) -> Result<u64> {
        let mut patterns = self.patterns.write().await;
        let actual = patterns.get(&pattern.id).map(|p| p.version).unwrap_or(0);

        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(PatternError::VersionConflict {
                    id: pattern.id.clone(),
                    expected,
                    actual,
                });
            }
        }

        let mut stored = pattern.clone();
        stored.version = actual + 1;
        patterns.insert(stored.id.clone(), stored);
        Ok(actual + 1)
    }

    async fn search(&self, query: &SafeFtsQuery, limit: usize) -> Result<Vec<SearchHit>> {
        let patterns = self.patterns.read().await;
        let mut hits: Vec<SearchHit> = patterns
            .values()
            .filter_map(|pattern| {
                let text = searchable_text(pattern);
                if !evaluate(query.ast(), &text) {
                    return None;
                }
                let matched = query
                    .ast()
                    .positive_leaves()
                    .iter()
                    .filter(|leaf| contains_phrase(&text, leaf))
                    .count();
                Some(SearchHit {
                    pattern: pattern.clone(),
                    relevance: matched as f64,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern.id.cmp(&b.pattern.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Same columns the SQLite index covers, tokenized like its default tokenizer
fn searchable_text(pattern: &Pattern) -> String {
    let raw = format!(
        "{} {} {} {}",
        pattern.title,
        pattern.summary,
        pattern.tags.join(" "),
        pattern.keywords.join(" ")
    );
    format!(" {} ", normalize_tokens(&raw))
}

fn normalize_tokens(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(text: &str, leaf: &str) -> bool {
    let needle = normalize_tokens(leaf);
    if needle.is_empty() {
        warn!(leaf, "Query leaf has no searchable tokens");
        return false;
    }
    text.contains(&format!(" {} ", needle))
}

fn evaluate(node: &QueryNode, text: &str) -> bool {
    match node {
        QueryNode::Term(t) | QueryNode::Phrase(t) => contains_phrase(text, t),
        QueryNode::And(children) => children.iter().all(|c| evaluate(c, text)),
        QueryNode::Or(children) => children.iter().any(|c| evaluate(c, text)),
        QueryNode::Not(child) => !evaluate(child, text),
    }
}
