//! The federated retrieval engine: staged source execution, per-source
//! timeouts, merge with per-source weighting, and learning-based rerank.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use lattice_config::RetrievalConfig;

use crate::canonical::CanonicalClient;
use crate::feedback::FeedbackStore;

use super::sources::{RetrievalSource, SourceQuery, SourceRow};
use super::{
    LearningDebug, PreferenceTerms, ResultRow, RetrievalDebug, SearchRequest, SearchResponse,
    SourceId, StagedFetchDebug, merge_key,
};

#[derive(Debug, Clone, Copy)]
pub struct LearningParams {
    pub boost: f64,
    pub penalty: f64,
}

pub struct RetrievalEngine {
    sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>>,
    feedback: Option<Arc<FeedbackStore>>,
    canonical: Option<Arc<CanonicalClient>>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RetrievalEngine {
    pub fn new(
        sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>>,
        feedback: Option<Arc<FeedbackStore>>,
        canonical: Option<Arc<CanonicalClient>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            sources,
            feedback,
            canonical,
            config,
        }
    }

    pub fn available_sources(&self) -> Vec<SourceId> {
        self.sources.keys().copied().collect()
    }

    pub async fn search(&self, request: &SearchRequest) -> SearchResponse {
        let mut warnings = Vec::new();
        let mut debug = RetrievalDebug::default();
        let limit = request.limit.clamp(1, 50);

        // Preference context is best-effort; its absence downgrades to
        // non-reranked retrieval.
        let learning_requested = request.rerank_with_learning && self.config.learning_enabled;
        let mut terms = PreferenceTerms::default();
        let mut preferences_json = None;
        if learning_requested || request.include_preferences {
            match &self.feedback {
                Some(store) => {
                    match store
                        .build_preference_context(
                            request.project.as_deref(),
                            request.user_id.as_deref(),
                            100,
                        )
                        .await
                    {
                        Ok(context) => {
                            terms = context.terms();
                            if request.include_preferences {
                                preferences_json = serde_json::to_value(&context).ok();
                            }
                        }
                        Err(err) => {
                            warnings.push(format!("Preference context unavailable: {err}"));
                        }
                    }
                }
                None => {
                    if request.include_preferences {
                        warnings.push("Preference store is not configured".to_string());
                    }
                }
            }
        }
        let learning_active = learning_requested && !terms.is_empty();

        // Resolve the source set against what is actually configured.
        let requested: Vec<String> = request
            .sources
            .clone()
            .unwrap_or_else(|| self.config.sources.clone());
        let mut resolved: Vec<SourceId> = Vec::new();
        for name in &requested {
            match SourceId::parse(name) {
                Some(id) if self.sources.contains_key(&id) => {
                    if !resolved.contains(&id) {
                        resolved.push(id);
                    }
                }
                Some(id) => {
                    warnings.push(format!("retrieval source '{id}' is not configured"));
                }
                None => warnings.push(format!("unknown retrieval source '{name}' ignored")),
            }
        }
        if resolved.is_empty() {
            warnings.push("no usable retrieval sources; defaulting to vector".to_string());
            if self.sources.contains_key(&SourceId::Vector) {
                resolved.push(SourceId::Vector);
            }
        }
        debug.resolved_sources = resolved.iter().map(|id| id.as_str().to_string()).collect();

        let mut weights: BTreeMap<String, f64> = self
            .config
            .source_weights
            .iter()
            .map(|(name, weight)| (name.clone(), *weight))
            .collect();
        if let Some(overrides) = &request.source_weights {
            for (name, weight) in overrides {
                weights.insert(name.clone(), *weight);
            }
        }
        debug.weights = weights.clone();

        let query = SourceQuery {
            query: request.query.clone(),
            project: request.project.clone(),
            topic_path: request.topic_path.clone(),
            limit: limit * 2,
        };

        // Staged plan: fast sources first, slow sources only when the fast
        // stage left doubt.
        let fast_ids: Vec<SourceId> = self
            .config
            .fast_sources
            .iter()
            .filter_map(|name| SourceId::parse(name))
            .collect();
        let slow_ids: Vec<SourceId> = self
            .config
            .slow_sources
            .iter()
            .filter_map(|name| SourceId::parse(name))
            .collect();
        let mut fast: Vec<SourceId> = resolved
            .iter()
            .copied()
            .filter(|id| !slow_ids.contains(id))
            .collect();
        let slow: Vec<SourceId> = resolved
            .iter()
            .copied()
            .filter(|id| slow_ids.contains(id))
            .collect();
        let staged =
            self.config.staged_fetch && !fast_ids.is_empty() && !slow_ids.is_empty() && !slow.is_empty();

        let mut rows_by_source: BTreeMap<SourceId, Vec<SourceRow>> = BTreeMap::new();
        if staged {
            self.run_stage(&fast, &query, &mut rows_by_source, &mut debug, &mut warnings)
                .await;
            let fast_count: usize = rows_by_source.values().map(Vec::len).sum();
            let top_score = rows_by_source
                .values()
                .flatten()
                .map(|row| row.score)
                .fold(0.0f64, f64::max);
            let skip_slow = fast_count >= self.config.min_results_for_skip
                && (top_score >= self.config.min_top_score || fast_count >= limit * 2);
            let mut staged_debug = StagedFetchDebug {
                enabled: true,
                fast_sources: fast.iter().map(|id| id.as_str().to_string()).collect(),
                ..StagedFetchDebug::default()
            };
            if skip_slow {
                staged_debug.slow_sources_skipped =
                    slow.iter().map(|id| id.as_str().to_string()).collect();
            } else {
                staged_debug.slow_sources_run =
                    slow.iter().map(|id| id.as_str().to_string()).collect();
                self.run_stage(&slow, &query, &mut rows_by_source, &mut debug, &mut warnings)
                    .await;
            }
            debug.staged_fetch = Some(staged_debug);
        } else {
            fast.extend(slow);
            self.run_stage(&fast, &query, &mut rows_by_source, &mut debug, &mut warnings)
                .await;
        }

        let params = LearningParams {
            boost: self.config.learning_boost,
            penalty: self.config.learning_penalty,
        };
        let mut results = merge_federated_rows(
            &rows_by_source,
            &weights,
            &terms,
            learning_active,
            params,
            limit,
        );
        debug.learning = LearningDebug {
            enabled: learning_active,
            positive_terms: terms.positive.len(),
            negative_terms: terms.negative.len(),
            adjusted_rows: results
                .iter()
                .filter(|row| row.learning_adjustment != 0.0)
                .count(),
        };

        if request.include_content {
            self.attach_content(&mut results, &mut warnings).await;
        }

        SearchResponse {
            results,
            preferences: preferences_json,
            learning_enabled: learning_requested,
            warnings,
            retrieval: request.include_retrieval_debug.then_some(debug),
        }
    }

    async fn run_stage(
        &self,
        ids: &[SourceId],
        query: &SourceQuery,
        rows_by_source: &mut BTreeMap<SourceId, Vec<SourceRow>>,
        debug: &mut RetrievalDebug,
        warnings: &mut Vec<String>,
    ) {
        let timeout = Duration::from_secs_f64(self.config.source_timeout_secs.max(0.1));
        let futures = ids.iter().filter_map(|id| {
            let source = self.sources.get(id)?;
            let source = Arc::clone(source);
            let query = query.clone();
            let id = *id;
            Some(async move {
                let outcome = tokio::time::timeout(timeout, source.search(&query)).await;
                (id, outcome)
            })
        });

        for (id, outcome) in join_all(futures).await {
            match outcome {
                Ok(Ok(rows)) => {
                    debug
                        .source_counts
                        .insert(id.as_str().to_string(), rows.len());
                    rows_by_source.insert(id, rows);
                }
                Ok(Err(err)) => {
                    warnings.push(format!("{id} retrieval failed: {err}"));
                    debug
                        .source_errors
                        .insert(id.as_str().to_string(), err.to_string());
                }
                Err(_) => {
                    warnings.push(format!("{id} retrieval timed out"));
                    debug
                        .source_errors
                        .insert(id.as_str().to_string(), "timed out".to_string());
                }
            }
        }
    }

    async fn attach_content(&self, results: &mut [ResultRow], warnings: &mut Vec<String>) {
        let Some(canonical) = &self.canonical else {
            warnings.push("canonical store unavailable; content not attached".to_string());
            return;
        };
        for row in results.iter_mut() {
            if row.project.is_empty() || row.file.is_empty() {
                continue;
            }
            match canonical.read_file(&row.project, &row.file, true, false).await {
                Ok(content) if !content.is_empty() => row.content = Some(content),
                Ok(_) => {}
                Err(err) => {
                    warnings.push(format!(
                        "content fetch failed for {}/{}: {err}",
                        row.project, row.file
                    ));
                }
            }
        }
    }
}

/// Merge per-source rows into ranked results. Identity is `project:file`
/// (or a summary hash when coordinates are missing); the best composite
/// wins, source labels union, and the learning adjustment is applied to the
/// weighted base score.
pub fn merge_federated_rows(
    rows_by_source: &BTreeMap<SourceId, Vec<SourceRow>>,
    weights: &BTreeMap<String, f64>,
    terms: &PreferenceTerms,
    learning_active: bool,
    params: LearningParams,
    limit: usize,
) -> Vec<ResultRow> {
    let mut merged: BTreeMap<String, ResultRow> = BTreeMap::new();

    for (source, rows) in rows_by_source {
        let weight = weights.get(source.as_str()).copied().unwrap_or(1.0);
        for row in rows {
            let base = row.score;
            let mut adjustment = 0.0;
            if learning_active {
                let haystack = format!("{} {}", row.file, row.summary).to_lowercase();
                let positive_hits = terms
                    .positive
                    .iter()
                    .filter(|term| haystack.contains(term.as_str()))
                    .count() as f64;
                let negative_hits = terms
                    .negative
                    .iter()
                    .filter(|term| haystack.contains(term.as_str()))
                    .count() as f64;
                adjustment = positive_hits * params.boost - negative_hits * params.penalty;
            }
            let composite = base * weight + adjustment;
            let key = merge_key(&row.project, &row.file, &row.summary);
            let label = source.as_str().to_string();
            match merged.get_mut(&key) {
                Some(existing) => {
                    if !existing.sources.contains(&label) {
                        existing.sources.push(label);
                    }
                    existing.base_score = existing.base_score.max(base);
                    if composite > existing.score {
                        existing.score = composite;
                        existing.summary = row.summary.clone();
                        existing.learning_adjustment = adjustment;
                    }
                }
                None => {
                    merged.insert(
                        key,
                        ResultRow {
                            project: row.project.clone(),
                            file: row.file.clone(),
                            summary: row.summary.clone(),
                            score: composite,
                            base_score: base,
                            learning_adjustment: adjustment,
                            sources: vec![label],
                            content: None,
                        },
                    );
                }
            }
        }
    }

    let mut results: Vec<ResultRow> = merged.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.base_score.total_cmp(&a.base_score))
            .then_with(|| a.project.cmp(&b.project))
            .then_with(|| a.file.cmp(&b.file))
    });
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(project: &str, file: &str, summary: &str, score: f64) -> SourceRow {
        SourceRow {
            project: project.to_string(),
            file: file.to_string(),
            summary: summary.to_string(),
            score,
        }
    }

    #[test]
    fn merge_applies_learning_adjustment() {
        let mut rows = BTreeMap::new();
        rows.insert(
            SourceId::Raw,
            vec![row(
                "alpha",
                "notes/a.txt",
                "prefer structured output for retrieval",
                0.4,
            )],
        );
        let mut weights = BTreeMap::new();
        weights.insert("raw".to_string(), 1.0);
        let mut terms = PreferenceTerms::default();
        terms.positive.insert("structured".to_string());
        terms.positive.insert("retrieval".to_string());

        let merged = merge_federated_rows(
            &rows,
            &weights,
            &terms,
            true,
            LearningParams {
                boost: 0.08,
                penalty: 0.12,
            },
            5,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].learning_adjustment > 0.0);
        assert!(merged[0].score > merged[0].base_score);
    }

    #[test]
    fn merge_unions_sources_and_keeps_best_composite() {
        let mut rows = BTreeMap::new();
        rows.insert(
            SourceId::Vector,
            vec![row("alpha", "a.md", "vector view", 0.9)],
        );
        rows.insert(SourceId::Raw, vec![row("alpha", "a.md", "raw view", 0.5)]);
        let mut weights = BTreeMap::new();
        weights.insert("vector".to_string(), 1.0);
        weights.insert("raw".to_string(), 0.85);

        let merged = merge_federated_rows(
            &rows,
            &weights,
            &PreferenceTerms::default(),
            false,
            LearningParams {
                boost: 0.08,
                penalty: 0.12,
            },
            5,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sources.len(), 2);
        assert!((merged[0].score - 0.9).abs() < 1e-9);
        assert_eq!(merged[0].summary, "vector view");
    }

    #[test]
    fn results_are_monotonically_non_increasing() {
        let mut rows = BTreeMap::new();
        rows.insert(
            SourceId::Raw,
            vec![
                row("alpha", "a.md", "first", 0.2),
                row("alpha", "b.md", "second", 0.9),
                row("alpha", "c.md", "third", 0.5),
            ],
        );
        let weights = BTreeMap::new();
        let merged = merge_federated_rows(
            &rows,
            &weights,
            &PreferenceTerms::default(),
            false,
            LearningParams {
                boost: 0.0,
                penalty: 0.0,
            },
            2,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged[0].score >= merged[1].score);
    }
}
