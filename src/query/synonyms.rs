//! Synonym expansion
//!
//! The table is built from a flat `term -> [synonyms]` map and made
//! symmetric: if `auth` lists `authentication`, then `authentication` also
//! expands to `auth`. Expansion is one hop only, so synonyms of synonyms are
//! never pulled in.

use crate::types::PatternType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Built-in table used when the config does not supply one
const DEFAULT_SYNONYMS: &[(&str, &[&str])] = &[
    ("auth", &["authentication", "authorization", "login", "oauth"]),
    ("db", &["database", "sql", "persistence"]),
    ("config", &["configuration", "settings"]),
    ("err", &["error", "exception", "failure"]),
    ("test", &["testing", "spec", "assertion"]),
    ("perf", &["performance", "latency", "throughput"]),
    ("k8s", &["kubernetes"]),
    ("js", &["javascript"]),
    ("ts", &["typescript"]),
    ("py", &["python"]),
    ("async", &["concurrency", "await", "futures"]),
    ("cache", &["caching", "memoization"]),
    ("retry", &["backoff", "resilience"]),
    ("deploy", &["deployment", "release", "rollout"]),
    ("api", &["endpoint", "rest", "http"]),
];

/// Which original token produced which synonyms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionSource {
    pub token: String,
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    /// Tokens as they appeared in the query
    pub original: Vec<String>,
    /// Original tokens followed by every added synonym, deduplicated
    pub terms: Vec<String>,
    /// Only the synonyms that were added, in the order they were added
    pub synonyms: Vec<String>,
    pub sources: Vec<ExpansionSource>,
}

impl Expansion {
    pub fn added(&self) -> &[String] {
        &self.synonyms
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynonymExpander {
    /// Lowercased term -> synonyms in declaration order
    table: HashMap<String, Vec<String>>,
}

impl SynonymExpander {
    pub fn from_config(config: &BTreeMap<String, Vec<String>>) -> Self {
        let mut expander = Self::default();
        for (term, synonyms) in config {
            for synonym in synonyms {
                expander.link(term, synonym);
            }
        }
        expander
    }

    pub fn with_defaults() -> Self {
        let mut expander = Self::default();
        for (term, synonyms) in DEFAULT_SYNONYMS {
            for synonym in *synonyms {
                expander.link(term, synonym);
            }
        }
        expander
    }

    fn link(&mut self, a: &str, b: &str) {
        let (a, b) = (a.trim().to_lowercase(), b.trim().to_lowercase());
        if a.is_empty() || b.is_empty() || a == b {
            return;
        }
        push_unique(self.table.entry(a.clone()).or_default(), &b);
        push_unique(self.table.entry(b).or_default(), &a);
    }

    pub fn synonyms(&self, term: &str) -> &[String] {
        self.table
            .get(&term.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Tokenize `query` (quoted phrases stay whole) and expand each token
    pub fn expand(&self, query: &str, max_per_term: usize) -> Expansion {
        let tokens = tokenize(query);
        let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        self.expand_tokens(&refs, max_per_term)
    }

    /// Expand already-tokenized input
    pub fn expand_tokens(&self, tokens: &[&str], max_per_term: usize) -> Expansion {
        let mut seen: HashSet<String> = HashSet::new();
        let mut terms = Vec::new();
        for token in tokens {
            if seen.insert(token.to_lowercase()) {
                terms.push(token.to_string());
            }
        }

        let mut sources = Vec::new();
        let mut synonyms = Vec::new();
        for token in tokens {
            let candidates = self.candidates_for(token);
            let added: Vec<String> = candidates
                .into_iter()
                .filter(|c| seen.insert(c.to_lowercase()))
                .take(max_per_term)
                .collect();
            if !added.is_empty() {
                terms.extend(added.iter().cloned());
                synonyms.extend(added.iter().cloned());
                sources.push(ExpansionSource {
                    token: token.to_string(),
                    synonyms: added,
                });
            }
        }

        Expansion {
            original: tokens.iter().map(|t| t.to_string()).collect(),
            terms,
            synonyms,
            sources,
        }
    }

    /// `TYPE:CATEGORY` tokens expand the category and keep the type prefix
    fn candidates_for(&self, token: &str) -> Vec<String> {
        if let Some((prefix, category)) = token.split_once(':') {
            if prefix.parse::<PatternType>().is_ok() && !category.is_empty() && !category.contains(':') {
                return self
                    .synonyms(category)
                    .iter()
                    .map(|s| format!("{}:{}", prefix, s))
                    .collect();
            }
        }
        self.synonyms(token).to_vec()
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Whitespace tokenizer that keeps quoted phrases whole and drops operators
pub fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let flush = |buf: &mut String, tokens: &mut Vec<String>| {
        let word = buf.trim().trim_matches(|c: char| c == '(' || c == ')').to_string();
        if !word.is_empty() && !matches!(word.as_str(), "AND" | "OR" | "NOT") {
            tokens.push(word);
        }
        buf.clear();
    };

    for c in query.chars() {
        match c {
            '"' if in_quotes => {
                in_quotes = false;
                let phrase = current.trim().to_string();
                if !phrase.is_empty() {
                    tokens.push(phrase);
                }
                current.clear();
            }
            '"' => {
                flush(&mut current, &mut tokens);
                in_quotes = true;
            }
            c if c.is_whitespace() && !in_quotes => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_jwt_expansion() {
        let expander = SynonymExpander::with_defaults();
        let expansion = expander.expand("auth jwt", 3);
        assert!(expansion.terms.contains(&"authentication".to_string()));
        assert!(expansion.terms.contains(&"authorization".to_string()));
        assert_eq!(expansion.original, vec!["auth", "jwt"]);
        assert_eq!(expansion.sources[0].token, "auth");
    }

    #[test]
    fn test_symmetric_and_one_hop() {
        let mut config = BTreeMap::new();
        config.insert("auth".to_string(), vec!["authentication".to_string()]);
        config.insert("authentication".to_string(), vec!["identity".to_string()]);
        let expander = SynonymExpander::from_config(&config);

        assert_eq!(expander.synonyms("authentication"), &["auth", "identity"]);
        let expansion = expander.expand("auth", 10);
        assert_eq!(expansion.added(), &["authentication"]);
        assert!(!expansion.terms.contains(&"identity".to_string()));
    }

    #[test]
    fn test_cap_per_term() {
        let expander = SynonymExpander::with_defaults();
        let expansion = expander.expand("auth", 2);
        assert_eq!(expansion.added().len(), 2);
    }

    #[test]
    fn test_quoted_phrase_is_one_token() {
        let tokens = tokenize("\"token refresh\" AND (db OR cache)");
        assert_eq!(tokens, vec!["token refresh", "db", "cache"]);
    }

    #[test]
    fn test_pattern_aware_category() {
        let expander = SynonymExpander::with_defaults();
        let expansion = expander.expand("ANTI:auth", 2);
        assert_eq!(
            expansion.added(),
            &["ANTI:authentication", "ANTI:authorization"]
        );
    }

    #[test]
    fn test_unknown_prefix_is_plain_token() {
        let expander = SynonymExpander::with_defaults();
        assert!(expander.expand("WIDGET:auth", 3).added().is_empty());
    }

    #[test]
    fn test_no_duplicate_terms() {
        let expander = SynonymExpander::with_defaults();
        let expansion = expander.expand("auth authentication", 5);
        let lower: HashSet<String> = expansion.terms.iter().map(|t| t.to_lowercase()).collect();
        assert_eq!(lower.len(), expansion.terms.len());
    }
}
