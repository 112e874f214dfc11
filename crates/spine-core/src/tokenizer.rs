use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());

/// Tokenize text into lowercase words.
/// Preserves apostrophes within words (e.g., "don't").
/// No stemming and no stop-word list; retrieval IDF discounts common words.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    cleaned
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Distinct tokens of `text`, in first-seen order.
pub fn unique_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Distinct tokens of `text` as a set, for membership tests during scoring.
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}
