//! Federated retrieval: the storage backends viewed as read sources, merged
//! into one ranked answer.

pub mod embedding;
pub mod engine;
pub mod sources;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub use engine::RetrievalEngine;
pub use sources::{RetrievalSource, SourceQuery, SourceRow};

/// A single retrieval origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    Vector,
    Raw,
    Analytic,
    Archival,
    CanonicalLexical,
}

impl SourceId {
    pub const ALL: [SourceId; 5] = [
        SourceId::Vector,
        SourceId::Raw,
        SourceId::Analytic,
        SourceId::Archival,
        SourceId::CanonicalLexical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Raw => "raw",
            Self::Analytic => "analytic",
            Self::Archival => "archival",
            Self::CanonicalLexical => "canonical-lexical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vector" => Some(Self::Vector),
            "raw" => Some(Self::Raw),
            "analytic" => Some(Self::Analytic),
            "archival" => Some(Self::Archival),
            "canonical-lexical" | "canonical_lexical" => Some(Self::CanonicalLexical),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_limit() -> usize {
    8
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub project: Option<String>,
    pub topic_path: Option<String>,
    pub sources: Option<Vec<String>>,
    pub source_weights: Option<HashMap<String, f64>>,
    #[serde(default = "default_true")]
    pub rerank_with_learning: bool,
    #[serde(default)]
    pub include_retrieval_debug: bool,
    pub user_id: Option<String>,
    #[serde(default)]
    pub include_preferences: bool,
    #[serde(default)]
    pub include_content: bool,
}

impl SearchRequest {
    pub fn simple(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: default_limit(),
            project: None,
            topic_path: None,
            sources: None,
            source_weights: None,
            rerank_with_learning: true,
            include_retrieval_debug: false,
            user_id: None,
            include_preferences: false,
            include_content: false,
        }
    }
}

/// A merged, ranked result row.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRow {
    pub project: String,
    pub file: String,
    pub summary: String,
    /// Composite score after weighting and learning adjustment.
    pub score: f64,
    pub base_score: f64,
    pub learning_adjustment: f64,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StagedFetchDebug {
    pub enabled: bool,
    pub fast_sources: Vec<String>,
    pub slow_sources_run: Vec<String>,
    pub slow_sources_skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LearningDebug {
    pub enabled: bool,
    pub positive_terms: usize,
    pub negative_terms: usize,
    pub adjusted_rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalDebug {
    pub resolved_sources: Vec<String>,
    pub weights: BTreeMap<String, f64>,
    pub source_counts: BTreeMap<String, usize>,
    pub source_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_fetch: Option<StagedFetchDebug>,
    pub learning: LearningDebug,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ResultRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<serde_json::Value>,
    pub learning_enabled: bool,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalDebug>,
}

/// Positive/negative term sets distilled from the preference store.
#[derive(Debug, Clone, Default)]
pub struct PreferenceTerms {
    pub positive: HashSet<String>,
    pub negative: HashSet<String>,
}

impl PreferenceTerms {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

/// Lowercased alphanumeric terms of three or more characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| term.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Fraction of query terms present in `text`, with a small bonus when the
/// whole query appears verbatim. Range `0.0..=1.0`.
pub fn lexical_score(query: &str, text: &str) -> f64 {
    let terms = tokenize(query);
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = terms
        .iter()
        .filter(|term| haystack.contains(term.as_str()))
        .count();
    if hits == 0 {
        return 0.0;
    }
    let base = 0.3 + 0.6 * (hits as f64 / terms.len() as f64);
    let bonus = if haystack.contains(query.to_lowercase().trim()) {
        0.1
    } else {
        0.0
    };
    (base + bonus).min(1.0)
}

/// Merge identity for a source row. Rows without coordinates fall back to a
/// stable hash of the summary; identical summaries from different sources
/// therefore merge, which is the intended dedup for coordinate-less rows.
pub fn merge_key(project: &str, file: &str, summary: &str) -> String {
    if !project.is_empty() && !file.is_empty() {
        format!("{project}:{file}")
    } else {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(summary.as_bytes());
        format!("sum:{}", hex::encode(&digest[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_score_rewards_term_hits() {
        let full = lexical_score("queue depth", "queue depth snapshot for telemetry");
        let partial = lexical_score("queue depth", "the queue is busy");
        let none = lexical_score("queue depth", "unrelated text");
        assert!(full > partial);
        assert!(partial > none);
        assert_eq!(none, 0.0);
        assert!(full <= 1.0);
    }

    #[test]
    fn merge_key_prefers_coordinates() {
        assert_eq!(merge_key("alpha", "a.md", "s"), "alpha:a.md");
        let hashed = merge_key("", "", "same summary");
        assert!(hashed.starts_with("sum:"));
        assert_eq!(hashed, merge_key("", "", "same summary"));
    }

    #[test]
    fn source_id_round_trips() {
        for id in SourceId::ALL {
            assert_eq!(SourceId::parse(id.as_str()), Some(id));
        }
        assert_eq!(SourceId::parse("canonical_lexical"), Some(SourceId::CanonicalLexical));
        assert_eq!(SourceId::parse("bogus"), None);
    }
}
