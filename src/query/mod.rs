//! Query processing
//!
//! Every request goes through [`QueryProcessor::process`]:
//!
//! 1. Parse with [`FtsQueryParser`] (always, even in performance mode)
//! 2. Expand positive leaves with one-hop synonyms into OR groups
//! 3. Emit a [`SafeFtsQuery`] for the storage layer
//!
//! After search, [`QueryProcessor::rerank`] applies typo-tolerant field
//! similarity to drop candidates that only matched by accident.

pub mod fuzzy;
pub mod parser;
pub mod synonyms;

use crate::config::{FieldWeights, QueryConfig};
use crate::error::{PatternError, Result};
use crate::types::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use fuzzy::{levenshtein, FuzzyMatcher, Suggestion};
pub use parser::{ast_to_fts_query, check_forbidden, FtsQueryParser, ParsedQuery, QueryNode, SafeFtsQuery};
pub use synonyms::{tokenize, Expansion, ExpansionSource, SynonymExpander};

#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    /// The query as the caller wrote it
    pub ast: QueryNode,
    /// Expanded query, ready for storage search
    pub safe: SafeFtsQuery,
    /// `None` in performance mode or when synonyms are disabled
    pub expansion: Option<Expansion>,
    /// Positive leaf texts plus added synonyms, used for reranking
    pub terms: Vec<String>,
}

/// A candidate with its weighted field similarity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedPattern {
    pub pattern: Pattern,
    pub similarity: f64,
}

pub struct QueryProcessor {
    config: QueryConfig,
    parser: FtsQueryParser,
    synonyms: SynonymExpander,
    fuzzy: Arc<FuzzyMatcher>,
}

impl QueryProcessor {
    pub fn new(config: &QueryConfig, synonyms: SynonymExpander) -> Self {
        Self {
            parser: FtsQueryParser::new(config),
            fuzzy: Arc::new(FuzzyMatcher::new(config.levenshtein_cache_capacity)),
            synonyms,
            config: config.clone(),
        }
    }

    pub fn fuzzy(&self) -> &Arc<FuzzyMatcher> {
        &self.fuzzy
    }

    pub fn parser(&self) -> &FtsQueryParser {
        &self.parser
    }

    pub fn process(&self, text: &str, performance_mode: bool) -> Result<ProcessedQuery> {
        let parsed = self.parser.parse(text)?;
        ensure_anchored_negation(&parsed.ast)?;

        let positive: Vec<String> = parsed.ast.positive_leaves().into_iter().map(String::from).collect();

        if performance_mode || !self.config.synonyms_enabled {
            return Ok(ProcessedQuery {
                ast: parsed.ast,
                safe: parsed.safe,
                expansion: None,
                terms: positive,
            });
        }

        let refs: Vec<&str> = positive.iter().map(String::as_str).collect();
        let expansion = self.synonyms.expand_tokens(&refs, self.config.max_synonyms_per_term);

        let mut by_token: HashMap<&str, Vec<&str>> = HashMap::new();
        for source in &expansion.sources {
            let usable: Vec<&str> = source
                .synonyms
                .iter()
                .map(String::as_str)
                .filter(|s| check_forbidden(s).is_ok())
                .collect();
            if !usable.is_empty() {
                by_token.insert(source.token.as_str(), usable);
            }
        }

        let mut budget = self.config.max_expanded_terms.saturating_sub(parsed.ast.leaf_count());
        let expanded = expand_node(&parsed.ast, &by_token, &mut budget);
        debug!(
            original = %parsed.safe,
            added = expansion.synonyms.len(),
            "Expanded query"
        );

        let mut terms = positive;
        for synonym in expansion.added() {
            if !terms.iter().any(|t| t.eq_ignore_ascii_case(synonym)) {
                terms.push(synonym.clone());
            }
        }

        Ok(ProcessedQuery {
            ast: parsed.ast,
            safe: SafeFtsQuery::from_ast(expanded),
            expansion: Some(expansion),
            terms,
        })
    }

    /// Weighted title/summary/tags similarity of a pattern to the query terms
    pub fn field_similarity(&self, pattern: &Pattern, terms: &[String]) -> f64 {
        let FieldWeights { title, summary, tags } = self.config.field_weights;
        let weight_sum = title + summary + tags;
        if terms.is_empty() || weight_sum <= 0.0 {
            return 0.0;
        }

        let tag_text = pattern.tags.join(" ");
        let score = title * self.text_similarity(&pattern.title, terms)
            + summary * self.text_similarity(&pattern.summary, terms)
            + tags * self.text_similarity(&tag_text, terms);
        (score / weight_sum).clamp(0.0, 1.0)
    }

    /// Mean over terms of the best per-word similarity in `text`
    fn text_similarity(&self, text: &str, terms: &[String]) -> f64 {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return 0.0;
        }

        let total: f64 = terms
            .iter()
            .map(|term| {
                let term = term.to_lowercase();
                if term.contains(char::is_whitespace) && lowered.contains(&term) {
                    return 1.0;
                }
                words
                    .iter()
                    .map(|w| self.fuzzy.similarity(&term, w))
                    .fold(0.0, f64::max)
            })
            .sum();
        total / terms.len() as f64
    }

    /// Order by similarity, drop those under the threshold, cap the count.
    ///
    /// The sort is stable, so storage relevance order survives among equals.
    pub fn rerank(&self, candidates: Vec<Pattern>, terms: &[String]) -> Vec<RerankedPattern> {
        let mut scored: Vec<RerankedPattern> = candidates
            .into_iter()
            .map(|pattern| RerankedPattern {
                similarity: self.field_similarity(&pattern, terms),
                pattern,
            })
            .collect();

        if !self.config.fuzzy_enabled || terms.is_empty() {
            return scored;
        }

        let before = scored.len();
        scored.retain(|c| c.similarity >= self.config.fuzzy_threshold);
        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.fuzzy_max_results);
        debug!(before, after = scored.len(), "Fuzzy rerank");
        scored
    }

    pub fn suggest_corrections<S: AsRef<str>>(&self, query: &str, dictionary: &[S], max: usize) -> Vec<Suggestion> {
        self.fuzzy.suggest_corrections(query, dictionary, max)
    }
}

impl Default for QueryProcessor {
    fn default() -> Self {
        Self::new(&QueryConfig::default(), SynonymExpander::with_defaults())
    }
}

/// Negation is binary in the index: a NOT needs a positive term before it
/// in the same conjunction.
fn ensure_anchored_negation(node: &QueryNode) -> Result<()> {
    let reject = || PatternError::validation("negated terms must follow a positive term");
    match node {
        QueryNode::Term(_) | QueryNode::Phrase(_) => Ok(()),
        QueryNode::Not(_) => Err(reject()),
        QueryNode::Or(children) => children.iter().try_for_each(ensure_anchored_negation),
        QueryNode::And(children) => {
            let Some(first) = children.first() else {
                return Err(PatternError::validation("query is empty"));
            };
            ensure_anchored_negation(first)?;
            for child in &children[1..] {
                match child {
                    QueryNode::Not(inner) => ensure_anchored_negation(inner)?,
                    other => ensure_anchored_negation(other)?,
                }
            }
            Ok(())
        }
    }
}

/// Rewrite each positive leaf as `leaf OR "synonym" ...` while budget lasts
fn expand_node(node: &QueryNode, synonyms: &HashMap<&str, Vec<&str>>, budget: &mut usize) -> QueryNode {
    match node {
        QueryNode::Term(text) | QueryNode::Phrase(text) => {
            let Some(list) = synonyms.get(text.as_str()) else {
                return node.clone();
            };
            let take = list.len().min(*budget);
            if take == 0 {
                return node.clone();
            }
            *budget -= take;
            let mut alternatives = Vec::with_capacity(take + 1);
            alternatives.push(node.clone());
            alternatives.extend(list[..take].iter().map(|s| QueryNode::Phrase(s.to_string())));
            QueryNode::Or(alternatives)
        }
        QueryNode::And(children) => {
            QueryNode::And(children.iter().map(|c| expand_node(c, synonyms, budget)).collect())
        }
        QueryNode::Or(children) => {
            QueryNode::Or(children.iter().map(|c| expand_node(c, synonyms, budget)).collect())
        }
        // Excluded terms stay exact
        QueryNode::Not(_) => node.clone(),
    }
}
