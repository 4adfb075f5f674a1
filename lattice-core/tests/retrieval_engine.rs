//! Federated retrieval engine tests over fake sources.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use lattice_config::RetrievalConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::retrieval::sources::{RetrievalSource, SourceQuery, SourceRow};
use lattice_core::retrieval::{RetrievalEngine, SearchRequest, SourceId};

struct FakeSource {
    id: SourceId,
    rows: Vec<SourceRow>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeSource {
    fn returning(id: SourceId, rows: Vec<SourceRow>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                id,
                rows,
                fail: false,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn failing(id: SourceId) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                id,
                rows: Vec::new(),
                fail: true,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl RetrievalSource for FakeSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn search(&self, _query: &SourceQuery) -> Result<Vec<SourceRow>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LatticeError::upstream("backend unavailable"));
        }
        Ok(self.rows.clone())
    }
}

fn row(project: &str, file: &str, summary: &str, score: f64) -> SourceRow {
    SourceRow {
        project: project.to_string(),
        file: file.to_string(),
        summary: summary.to_string(),
        score,
    }
}

fn config(staged: bool) -> RetrievalConfig {
    RetrievalConfig {
        sources: vec![
            "vector".into(),
            "raw".into(),
            "analytic".into(),
            "archival".into(),
            "canonical-lexical".into(),
        ],
        fast_sources: vec!["vector".into(), "raw".into(), "analytic".into()],
        slow_sources: vec!["archival".into(), "canonical-lexical".into()],
        staged_fetch: staged,
        min_results_for_skip: 1,
        min_top_score: 0.8,
        source_timeout_secs: 2.0,
        learning_enabled: true,
        learning_boost: 0.08,
        learning_penalty: 0.12,
        scan_cap: 100,
        project_file_cap: 50,
        total_file_cap: 200,
        source_weights: vec![
            ("vector".into(), 1.0),
            ("raw".into(), 0.85),
            ("archival".into(), 0.75),
            ("canonical-lexical".into(), 0.7),
        ],
    }
}

fn engine(
    sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>>,
    staged: bool,
) -> RetrievalEngine {
    RetrievalEngine::new(sources, None, None, config(staged))
}

#[tokio::test]
async fn staged_fetch_skips_slow_sources_on_confident_fast_results() {
    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    let (vector, _) = FakeSource::returning(
        SourceId::Vector,
        vec![row("alpha", "notes/a.txt", "high confidence answer", 0.95)],
    );
    let (raw, _) = FakeSource::returning(SourceId::Raw, vec![]);
    let (archival, archival_calls) = FakeSource::returning(SourceId::Archival, vec![]);
    let (lexical, lexical_calls) = FakeSource::returning(SourceId::CanonicalLexical, vec![]);
    sources.insert(SourceId::Vector, vector);
    sources.insert(SourceId::Raw, raw);
    sources.insert(SourceId::Archival, archival);
    sources.insert(SourceId::CanonicalLexical, lexical);

    let mut request = SearchRequest::simple("alpha");
    request.limit = 5;
    request.include_retrieval_debug = true;
    request.rerank_with_learning = false;
    let response = engine(sources, true).search(&request).await;

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].project, "alpha");
    let debug = response.retrieval.expect("debug requested");
    let staged = debug.staged_fetch.expect("staged plan ran");
    assert_eq!(
        staged.slow_sources_skipped,
        vec!["archival".to_string(), "canonical-lexical".to_string()]
    );
    assert!(staged.slow_sources_run.is_empty());
    assert_eq!(archival_calls.load(Ordering::SeqCst), 0);
    assert_eq!(lexical_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn staged_fetch_runs_slow_sources_when_fast_stage_is_thin() {
    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    let (vector, _) = FakeSource::returning(
        SourceId::Vector,
        vec![row("alpha", "notes/a.txt", "weak match", 0.2)],
    );
    let (archival, archival_calls) = FakeSource::returning(
        SourceId::Archival,
        vec![row("alpha", "decisions/one.md", "archival hit", 0.6)],
    );
    sources.insert(SourceId::Vector, vector);
    sources.insert(SourceId::Archival, archival);

    let mut request = SearchRequest::simple("alpha");
    request.include_retrieval_debug = true;
    request.rerank_with_learning = false;
    let response = engine(sources, true).search(&request).await;

    assert_eq!(archival_calls.load(Ordering::SeqCst), 1);
    let staged = response.retrieval.unwrap().staged_fetch.unwrap();
    assert_eq!(staged.slow_sources_run, vec!["archival".to_string()]);
    assert_eq!(response.results.len(), 2);
}

#[tokio::test]
async fn single_source_failure_degrades_with_warning() {
    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    let (vector, _) = FakeSource::failing(SourceId::Vector);
    let (raw, _) = FakeSource::returning(
        SourceId::Raw,
        vec![row("alpha", "notes/a.txt", "alpha memory entry", 0.45)],
    );
    sources.insert(SourceId::Vector, vector);
    sources.insert(SourceId::Raw, raw);

    let mut request = SearchRequest::simple("alpha");
    request.sources = Some(vec!["vector".into(), "raw".into()]);
    request.include_retrieval_debug = true;
    request.rerank_with_learning = false;
    let response = engine(sources, false).search(&request).await;

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].project, "alpha");
    assert!(
        response
            .warnings
            .iter()
            .any(|warning| warning.contains("vector retrieval failed"))
    );
    let debug = response.retrieval.unwrap();
    assert!(debug.source_errors.contains_key("vector"));
}

#[tokio::test]
async fn results_respect_limit_and_ordering_invariants() {
    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    let (raw, _) = FakeSource::returning(
        SourceId::Raw,
        vec![
            row("alpha", "a.md", "first", 0.2),
            row("alpha", "b.md", "second", 0.9),
            row("alpha", "c.md", "third", 0.5),
            row("alpha", "d.md", "fourth", 0.7),
        ],
    );
    sources.insert(SourceId::Raw, raw);

    let mut request = SearchRequest::simple("anything");
    request.limit = 3;
    request.sources = Some(vec!["raw".into()]);
    request.rerank_with_learning = false;
    let response = engine(sources, false).search(&request).await;

    assert_eq!(response.results.len(), 3);
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for result in &response.results {
        assert!(!result.sources.is_empty());
        assert!(result.sources.iter().all(|source| source == "raw"));
    }
}

#[tokio::test]
async fn unknown_and_unconfigured_sources_produce_warnings() {
    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    let (vector, _) = FakeSource::returning(SourceId::Vector, vec![]);
    sources.insert(SourceId::Vector, vector);

    let mut request = SearchRequest::simple("alpha");
    request.sources = Some(vec!["bogus".into(), "archival".into()]);
    request.rerank_with_learning = false;
    let response = engine(sources, false).search(&request).await;

    assert!(response.results.is_empty());
    assert!(
        response
            .warnings
            .iter()
            .any(|warning| warning.contains("unknown retrieval source"))
    );
    assert!(
        response
            .warnings
            .iter()
            .any(|warning| warning.contains("defaulting to vector"))
    );
}
