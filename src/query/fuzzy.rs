//! Typo-tolerant matching
//!
//! Full Levenshtein distance (insert/delete/substitute, unit cost) over
//! Unicode scalar values, memoized in a FIFO cache so repeated reranking of
//! the same vocabulary stays cheap.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Default memo size
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Edit distance by two-row dynamic programming
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Bounded memo; evicts the oldest entry once full
struct DistanceCache {
    entries: HashMap<(String, String), usize>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl DistanceCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &(String, String)) -> Option<usize> {
        self.entries.get(key).copied()
    }

    fn insert(&mut self, key: (String, String), distance: usize) {
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, distance);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub term: String,
    pub distance: usize,
    /// True when the suggestion starts with the query
    pub prefix_match: bool,
}

pub struct FuzzyMatcher {
    cache: Mutex<DistanceCache>,
}

impl FuzzyMatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(DistanceCache::new(capacity)),
        }
    }

    /// Memoized edit distance. The key is order-independent.
    pub fn distance(&self, a: &str, b: &str) -> usize {
        if a == b {
            return 0;
        }
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };

        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hit) = cache.get(&key) {
            return hit;
        }
        let distance = levenshtein(&key.0, &key.1);
        cache.insert(key, distance);
        distance
    }

    /// `1 - distance / max(len)`; two empty strings are identical
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let longest = a.chars().count().max(b.chars().count());
        if longest == 0 {
            return 1.0;
        }
        1.0 - self.distance(a, b) as f64 / longest as f64
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .map(|c| c.entries.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().entries.len())
    }

    /// Candidates for a possibly misspelled `query`.
    ///
    /// Prefix matches come first (shortest first), then the remaining slots
    /// are filled by edit distance under `max(3, ceil(0.6 × len))`.
    pub fn suggest_corrections<S: AsRef<str>>(&self, query: &str, dictionary: &[S], max: usize) -> Vec<Suggestion> {
        let query = query.trim().to_lowercase();
        if query.is_empty() || max == 0 {
            return Vec::new();
        }

        let mut prefix: Vec<Suggestion> = Vec::new();
        let mut ranked: Vec<Suggestion> = Vec::new();
        let threshold = adaptive_threshold(&query);

        for word in dictionary {
            let term = word.as_ref().to_lowercase();
            if term == query {
                continue;
            }
            if term.starts_with(&query) {
                prefix.push(Suggestion {
                    distance: self.distance(&query, &term),
                    term,
                    prefix_match: true,
                });
                continue;
            }
            let distance = self.distance(&query, &term);
            if distance <= threshold {
                ranked.push(Suggestion {
                    term,
                    distance,
                    prefix_match: false,
                });
            }
        }

        prefix.sort_by(|a, b| a.term.len().cmp(&b.term.len()).then_with(|| a.term.cmp(&b.term)));
        ranked.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.term.cmp(&b.term)));

        let mut out: Vec<Suggestion> = Vec::with_capacity(max);
        for suggestion in prefix.into_iter().chain(ranked) {
            if out.len() >= max {
                break;
            }
            if !out.iter().any(|s| s.term == suggestion.term) {
                out.push(suggestion);
            }
        }
        out
    }
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// `max(3, ceil(0.6 × query length))`
pub fn adaptive_threshold(query: &str) -> usize {
    let len = query.chars().count() as f64;
    ((0.6 * len).ceil() as usize).max(3)
}
