// backend/src/services/semantic_lexicon.rs
//
// The concept -> synonyms lexicon used for semantic column hints. The
// mapping is static data shipped with the binary; extending it means adding
// entries to resources/semantic_lexicon.json, never changing code.

use once_cell::sync::Lazy;
use serde::Deserialize;

static LEXICON_JSON: &str = include_str!("../../resources/semantic_lexicon.json");

#[derive(Debug, Clone, Deserialize)]
pub struct Concept {
    pub concept: String,
    pub synonyms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Lexicon {
    concepts: Vec<Concept>,
}

static LEXICON: Lazy<Vec<Concept>> = Lazy::new(|| {
    let lexicon: Lexicon =
        serde_json::from_str(LEXICON_JSON).expect("embedded semantic lexicon is valid JSON");
    lexicon.concepts
});

/// All concepts in lexicon order.
pub fn concepts() -> &'static [Concept] {
    &LEXICON
}

/// Lowercase a column name and split it on non-alphanumeric boundaries.
pub fn normalize_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Concepts whose synonym tokens overlap the column name's tokens.
pub fn concepts_for_column(column: &str) -> Vec<&'static Concept> {
    let tokens = normalize_tokens(column);
    LEXICON
        .iter()
        .filter(|concept| {
            concept
                .synonyms
                .iter()
                .chain(std::iter::once(&concept.concept))
                .flat_map(|s| normalize_tokens(s))
                .any(|syn_token| tokens.contains(&syn_token))
        })
        .collect()
}

/// The union of matching synonym sets for a column name, deduplicated in
/// lexicon order. Empty when no concept matches.
pub fn hints_for_column(column: &str) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();
    for concept in concepts_for_column(column) {
        for synonym in &concept.synonyms {
            if !hints.contains(synonym) {
                hints.push(synonym.clone());
            }
        }
    }
    hints
}

/// The first matching concept in lexicon order, treated as the column's
/// dominant concept for cross-file grouping.
pub fn dominant_concept(column: &str) -> Option<&'static str> {
    concepts_for_column(column)
        .first()
        .map(|c| c.concept.as_str())
}
