//! Text normalization and similarity scoring for product/listing matching.

use std::collections::HashSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const DEFAULT_MAX_QUERY_TOKENS: usize = 6;

const COVERAGE_WEIGHT: f64 = 0.7;
const JACCARD_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    /// Position of the candidate in the slice handed to [`TextMatcher::rank`].
    pub index: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TextMatcher {
    max_query_tokens: usize,
}

impl Default for TextMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUERY_TOKENS)
    }
}

impl TextMatcher {
    pub fn new(max_query_tokens: usize) -> Self {
        Self {
            max_query_tokens: max_query_tokens.max(1),
        }
    }

    /// Lowercase, strip diacritics, collapse non-alphanumeric runs to one space.
    pub fn normalize(text: &str) -> String {
        text.nfd()
            .filter(|c| !is_combining_mark(*c))
            .flat_map(char::to_lowercase)
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Short search query: normalized tokens longer than one char, capped.
    pub fn build_query(&self, description: &str) -> String {
        Self::normalize(description)
            .split(' ')
            .filter(|t| t.chars().count() > 1)
            .take(self.max_query_tokens)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Coverage-weighted Jaccard of the token sets of two normalized strings.
    pub fn score(source: &str, candidate: &str) -> f64 {
        let a = source.split_whitespace().collect::<HashSet<_>>();
        let b = candidate.split_whitespace().collect::<HashSet<_>>();
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        COVERAGE_WEIGHT * shared / a.len() as f64 + JACCARD_WEIGHT * shared / union
    }

    /// Score every candidate against `description`, best first. Equal scores
    /// keep their original order.
    pub fn rank<T>(
        &self,
        description: &str,
        candidates: &[T],
        text_of: impl Fn(&T) -> &str,
    ) -> Vec<RankedCandidate> {
        let source = Self::normalize(description);
        let mut ranked = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| RankedCandidate {
                index,
                score: Self::score(&source, &Self::normalize(text_of(candidate))),
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }
}
