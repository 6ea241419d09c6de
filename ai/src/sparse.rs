//! Sparse lexical encoder: the keyword counterpart to the dense embedder.
//!
//! Produces stable token-id -> weight maps with BM25-style term-frequency
//! saturation. Ingest uses it to attach sparse vectors to records; retrieval
//! uses the same encoding for queries, so the token space always matches.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

const STOPWORDS: [&str; 32] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "to", "was", "were", "what", "when", "where", "which",
    "who", "will", "with", "this",
];

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{3040}'..='\u{30FF}')
}

/// Stable 32-bit token id from the token text.
pub fn token_id(token: &str) -> u32 {
    let digest = Sha256::digest(token.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Lowercased tokens: alphanumeric runs for Latin text, single chars for CJK.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if is_cjk(c) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .filter(|t| t.chars().count() > 1 || t.chars().next().map(is_cjk).unwrap_or(false))
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Encode text as token-id -> saturated term-frequency weight.
pub fn encode(text: &str) -> BTreeMap<u32, f32> {
    let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
    for token in tokenize(text) {
        *counts.entry(token_id(&token)).or_insert(0.0) += 1.0;
    }
    // BM25-flavored saturation with k1 = 1.2.
    counts
        .into_iter()
        .map(|(id, tf)| (id, tf / (tf + 1.2)))
        .collect()
}

/// The most frequent content-bearing tokens, for keyword payloads.
pub fn keywords(text: &str, top_n: usize) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(top_n).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenization_drops_stopwords_and_short_tokens() {
        let tokens = tokenize("The capital of France is Paris");
        assert_eq!(tokens, vec!["capital", "france", "paris"]);
    }

    #[test]
    fn cjk_chars_are_single_tokens() {
        let tokens = tokenize("\u{5317}\u{4eac}hello");
        assert_eq!(tokens, vec!["\u{5317}", "\u{4eac}", "hello"]);
    }

    #[test]
    fn encoding_is_stable_and_saturated() {
        let a = encode("capital capital capital");
        let b = encode("capital capital capital");
        assert_eq!(a, b);
        let weight = a.values().next().copied().unwrap();
        // tf=3 saturates to 3/4.2, below 1.0.
        assert!(weight > 0.5 && weight < 1.0);
    }

    #[test]
    fn overlapping_texts_share_token_ids() {
        let doc = encode("Paris is a city");
        let query = encode("capital of France Paris");
        let shared: Vec<&u32> = doc.keys().filter(|k| query.contains_key(k)).collect();
        assert!(!shared.is_empty());
    }

    #[test]
    fn keywords_rank_by_frequency() {
        let top = keywords("vector vector vector graph graph chunk", 2);
        assert_eq!(top, vec!["vector", "graph"]);
    }
}
