use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::ChunkType;

/// Retrieval modes supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Sparse,
    Hybrid,
    Graph,
    All,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Sparse => "sparse",
            SearchMode::Hybrid => "hybrid",
            SearchMode::Graph => "graph",
            SearchMode::All => "all",
        }
    }
}

// ============================================================================
// Filter expressions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    In,
    Gt,
    Lt,
}

/// `field op value` leaf of a filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterAtom {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

/// Small filter AST pushed to the storage façade where possible and applied
/// in-process otherwise. Supported fields: `document_id`,
/// `knowledge_base_id`, `chunk_type`, and custom metadata keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Atom(FilterAtom),
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: serde_json::Value) -> Self {
        FilterExpr::Atom(FilterAtom {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        })
    }

    /// Evaluate against a field lookup. Missing fields fail every comparison
    /// except `Ne`, which holds vacuously.
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Option<serde_json::Value>) -> bool {
        match self {
            FilterExpr::And(children) => children.iter().all(|c| c.matches(lookup)),
            FilterExpr::Or(children) => children.iter().any(|c| c.matches(lookup)),
            FilterExpr::Not(inner) => !inner.matches(lookup),
            FilterExpr::Atom(atom) => Self::atom_matches(atom, lookup(&atom.field)),
        }
    }

    fn atom_matches(atom: &FilterAtom, actual: Option<serde_json::Value>) -> bool {
        let actual = match actual {
            Some(v) => v,
            None => return matches!(atom.op, FilterOp::Ne),
        };
        match atom.op {
            FilterOp::Eq => actual == atom.value,
            FilterOp::Ne => actual != atom.value,
            FilterOp::In => atom
                .value
                .as_array()
                .map(|arr| arr.contains(&actual))
                .unwrap_or(false),
            FilterOp::Gt => Self::as_f64(&actual)
                .zip(Self::as_f64(&atom.value))
                .map(|(a, b)| a > b)
                .unwrap_or(false),
            FilterOp::Lt => Self::as_f64(&actual)
                .zip(Self::as_f64(&atom.value))
                .map(|(a, b)| a < b)
                .unwrap_or(false),
        }
    }

    fn as_f64(value: &serde_json::Value) -> Option<f64> {
        value.as_f64()
    }
}

// ============================================================================
// Requests & responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub knowledge_base_id: Uuid,
    pub query: String,
    pub mode: SearchMode,
    pub top_k: usize,
    pub filter: Option<FilterExpr>,
    #[serde(default)]
    pub enable_rerank: bool,
}

/// A ranked chunk returned by the retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub knowledge_base_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub score: f32,
    pub chunk_type: ChunkType,
    /// Modes that surfaced this chunk; the first entry won the score.
    pub matched_modes: Vec<SearchMode>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-response execution metadata; never an error channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub modes_completed: Vec<SearchMode>,
    pub modes_failed: Vec<SearchMode>,
    /// True when at least one requested mode missed its deadline or failed.
    pub partial: bool,
    pub rerank_failed: bool,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<RetrievedChunk>,
    pub metadata: SearchMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_fixture(field: &str) -> Option<serde_json::Value> {
        match field {
            "chunk_type" => Some(json!("text")),
            "page" => Some(json!(7)),
            _ => None,
        }
    }

    #[test]
    fn atom_eq_and_ne() {
        let eq = FilterExpr::eq("chunk_type", json!("text"));
        assert!(eq.matches(&lookup_fixture));
        let ne = FilterExpr::Atom(FilterAtom {
            field: "chunk_type".into(),
            op: FilterOp::Ne,
            value: json!("code"),
        });
        assert!(ne.matches(&lookup_fixture));
    }

    #[test]
    fn missing_field_only_satisfies_ne() {
        let eq = FilterExpr::eq("missing", json!("x"));
        assert!(!eq.matches(&lookup_fixture));
        let ne = FilterExpr::Atom(FilterAtom {
            field: "missing".into(),
            op: FilterOp::Ne,
            value: json!("x"),
        });
        assert!(ne.matches(&lookup_fixture));
    }

    #[test]
    fn compound_expressions() {
        let expr = FilterExpr::And(vec![
            FilterExpr::eq("chunk_type", json!("text")),
            FilterExpr::Or(vec![
                FilterExpr::Atom(FilterAtom {
                    field: "page".into(),
                    op: FilterOp::Gt,
                    value: json!(5),
                }),
                FilterExpr::eq("page", json!(1)),
            ]),
        ]);
        assert!(expr.matches(&lookup_fixture));

        let negated = FilterExpr::Not(Box::new(expr));
        assert!(!negated.matches(&lookup_fixture));
    }

    #[test]
    fn in_operator() {
        let expr = FilterExpr::Atom(FilterAtom {
            field: "chunk_type".into(),
            op: FilterOp::In,
            value: json!(["table", "text"]),
        });
        assert!(expr.matches(&lookup_fixture));
    }
}
