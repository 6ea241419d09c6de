//! Rule-based entity and relation extraction from chunk text.
//!
//! Deterministic by design: capitalized-span scanning with type heuristics,
//! and sentence-level co-occurrence for relations. Confidence reflects how
//! strong the classifying signal was.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use corpora_models::chunk::Chunk;
use corpora_models::graph::{Entity, EntityType, RelationType};

/// An extracted relation still referring to entities by name; ids are
/// assigned after the entities are merged into the graph.
#[derive(Debug, Clone)]
pub struct ExtractedRelation {
    pub source_name: String,
    pub target_name: String,
    pub relation_type: RelationType,
    pub confidence: f32,
    pub source_chunk_id: Uuid,
}

#[derive(Debug, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relations: Vec<ExtractedRelation>,
}

const ORG_SUFFIXES: [&str; 12] = [
    "Inc.", "Inc", "Corp.", "Corp", "Ltd.", "Ltd", "LLC", "GmbH", "Company", "Technologies",
    "University", "Institute",
];

const LOCATION_NAMES: [&str; 16] = [
    "France", "Germany", "China", "Japan", "Paris", "Berlin", "Beijing", "Tokyo", "London",
    "Europe", "Asia", "America", "California", "Shanghai", "Shenzhen", "Hangzhou",
];

const MONTHS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

// Sentence-leading words that are capitalized by grammar, not by naming.
const COMMON_SENTENCE_STARTERS: [&str; 14] = [
    "The", "This", "That", "These", "Those", "It", "In", "On", "At", "A", "An", "We", "They",
    "After",
];

static ABBREVIATIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(Inc|Corp|Ltd|Mr|Mrs|Dr|Prof|St|vs|etc|e\.g|i\.e)\.$").unwrap());

/// Split into sentences without breaking after known abbreviations.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.char_indices().collect::<Vec<_>>();

    for (i, (offset, c)) in bytes.iter().enumerate() {
        let is_terminator = matches!(c, '.' | '!' | '?' | '\u{3002}' | '\u{FF01}' | '\u{FF1F}');
        if !is_terminator {
            continue;
        }
        let end = offset + c.len_utf8();
        if *c == '.' {
            // Abbreviation guard: "Apple Inc. was founded" must not split.
            if ABBREVIATIONS.is_match(&text[start..end]) {
                continue;
            }
            // Decimal guard.
            if let Some((_, next)) = bytes.get(i + 1) {
                if next.is_ascii_digit() {
                    continue;
                }
            }
        }
        let candidate = text[start..end].trim();
        if !candidate.is_empty() {
            sentences.push(candidate);
        }
        start = end;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn is_capitalized(token: &str) -> bool {
    token
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

/// Candidate spans: maximal runs of capitalized tokens (connectors like
/// "of" allowed inside a run).
fn capitalized_spans(sentence: &str) -> Vec<String> {
    let tokens: Vec<&str> = sentence.split_whitespace().collect();
    let mut spans = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for (i, raw) in tokens.iter().enumerate() {
        let token = raw.trim_matches(|c: char| {
            c.is_ascii_punctuation() && c != '.' && c != '&' && c != '-'
        });
        if token.is_empty() {
            continue;
        }
        let keeps_run = !current.is_empty() && matches!(token, "of" | "&");
        if is_capitalized(token) || keeps_run {
            // Skip a lone grammatical capitalization at sentence start.
            if current.is_empty() && i == 0 && COMMON_SENTENCE_STARTERS.contains(&token) {
                continue;
            }
            current.push(token);
        } else if !current.is_empty() {
            spans.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        spans.push(current.join(" "));
    }

    spans
        .into_iter()
        .map(|s| {
            s.trim_end_matches(|c: char| matches!(c, ',' | ':') || c == '.' && !s.ends_with("Inc.") && !s.ends_with("Ltd.") && !s.ends_with("Corp."))
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty() && s.len() > 1)
        .collect()
}

/// Classify a span, returning the type and a confidence.
fn classify(span: &str) -> (EntityType, f32) {
    let tokens: Vec<&str> = span.split_whitespace().collect();
    let last = tokens.last().copied().unwrap_or("");

    if ORG_SUFFIXES.contains(&last) {
        return (EntityType::Organization, 0.9);
    }
    if tokens.len() == 2 && MONTHS.contains(&tokens[0]) && tokens[1].chars().all(|c| c.is_ascii_digit()) {
        return (EntityType::Date, 0.9);
    }
    if tokens.iter().all(|t| LOCATION_NAMES.contains(t)) {
        return (EntityType::Location, 0.85);
    }
    if tokens.len() >= 2
        && tokens.len() <= 3
        && tokens.iter().all(|t| {
            let mut chars = t.chars();
            chars.next().map(|c| c.is_uppercase()).unwrap_or(false)
                && chars.all(|c| c.is_lowercase())
        })
    {
        return (EntityType::Person, 0.75);
    }
    if tokens.len() == 1 && last.chars().all(|c| c.is_uppercase()) && last.len() >= 2 {
        // Acronyms read as products/technologies more often than people.
        return (EntityType::Technology, 0.6);
    }
    (EntityType::Concept, 0.5)
}

/// Relation vocabulary triggered by the connective between two mentions.
fn relation_from_connective(connective: &str) -> (RelationType, f32) {
    let lowered = connective.to_lowercase();
    let rules: [(&str, RelationType); 8] = [
        ("founded", RelationType::Founded),
        ("works for", RelationType::WorksFor),
        ("employee of", RelationType::WorksFor),
        ("located in", RelationType::LocatedIn),
        ("based in", RelationType::LocatedIn),
        ("part of", RelationType::PartOf),
        ("produces", RelationType::Produces),
        ("uses", RelationType::Uses),
    ];
    for (marker, relation_type) in rules {
        if lowered.contains(marker) {
            return (relation_type, 0.85);
        }
    }
    (RelationType::RelatedTo, 0.6)
}

/// Extract entities and co-occurrence relations from one chunk.
pub fn extract_from_chunk(chunk: &Chunk) -> Extraction {
    let mut extraction = Extraction::default();

    for sentence in split_sentences(&chunk.content) {
        let spans = capitalized_spans(sentence);
        let mut sentence_entities: Vec<(String, f32)> = Vec::new();

        for span in spans {
            let (entity_type, confidence) = classify(&span);
            sentence_entities.push((span.clone(), confidence));
            extraction.entities.push(Entity {
                id: Uuid::new_v4(),
                knowledge_base_id: chunk.knowledge_base_id,
                name: span,
                entity_type,
                confidence,
                source_chunk_ids: vec![chunk.id],
            });
        }

        // Pairwise co-occurrence within one sentence, typed by the text
        // between the two mentions.
        for i in 0..sentence_entities.len() {
            for j in (i + 1)..sentence_entities.len() {
                let (source, source_conf) = &sentence_entities[i];
                let (target, target_conf) = &sentence_entities[j];
                let connective = between(sentence, source, target).unwrap_or("");
                let (relation_type, relation_conf) = relation_from_connective(connective);
                extraction.relations.push(ExtractedRelation {
                    source_name: source.clone(),
                    target_name: target.clone(),
                    relation_type,
                    confidence: (source_conf.min(*target_conf) * relation_conf).min(0.95),
                    source_chunk_id: chunk.id,
                });
            }
        }
    }

    extraction
}

fn between<'a>(sentence: &'a str, first: &str, second: &str) -> Option<&'a str> {
    let start = sentence.find(first)? + first.len();
    let end = sentence[start..].find(second)? + start;
    Some(&sentence[start..end])
}
