//! Application state: every subsystem constructed once at startup and
//! shared behind `Arc`s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use lattice_config::LatticeConfig;
use lattice_core::canonical::CanonicalClient;
use lattice_core::fanout::sinks::{
    AnalyticSink, ArchivalSink, FanoutSink, ObservabilitySink, RawEventSink, VectorSink,
};
use lattice_core::fanout::{
    FanoutContext, FanoutHealth, FanoutSignal, TargetRateLimiters, spawn_workers,
};
use lattice_core::feedback::FeedbackStore;
use lattice_core::ingest::{IngestDeps, IngestService};
use lattice_core::outbox::{FanoutTarget, OutboxSupervisor, RetryPolicy};
use lattice_core::raw_store::RawStore;
use lattice_core::recent::RecentRing;
use lattice_core::retention::{RetentionManager, spawn_retention_workers};
use lattice_core::retrieval::embedding::EmbeddingClient;
use lattice_core::retrieval::sources::{
    AnalyticSource, ArchivalSource, CanonicalLexicalSource, RawSource, RetrievalSource,
    VectorSource,
};
use lattice_core::retrieval::{RetrievalEngine, SourceId};
use lattice_core::rollup::RollupBuffer;
use lattice_core::messaging::MessagingService;
use lattice_core::tasks::{
    ActionExecutor, TaskQueue, TaskWorkerHealth, spawn_task_workers,
};
use lattice_core::topics::TopicTree;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LatticeConfig>,
    pub ingest: Arc<IngestService>,
    pub retrieval: Arc<RetrievalEngine>,
    pub outbox: Arc<OutboxSupervisor>,
    pub tasks: Arc<TaskQueue>,
    pub feedback: Arc<FeedbackStore>,
    pub messaging: Arc<MessagingService>,
    pub retention: Arc<RetentionManager>,
    pub topics: Arc<TopicTree>,
    pub recent: Arc<RecentRing>,
    pub canonical: Option<Arc<CanonicalClient>>,
    pub fanout_health: Arc<FanoutHealth>,
    pub signal: Arc<FanoutSignal>,
    pub task_worker_health: Arc<TaskWorkerHealth>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

/// Everything main() needs to drive the background machinery.
pub struct BackgroundWorkers {
    pub shutdown: watch::Sender<bool>,
    pub handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BackgroundWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorkers")
            .field("handles", &self.handles.len())
            .finish()
    }
}

pub async fn build_state(config: LatticeConfig) -> anyhow::Result<(AppState, BackgroundWorkers)> {
    let config = Arc::new(config);

    let pool = lattice_core::db::open_sqlite_pool(&config.storage.task_db_path)
        .await
        .context("opening the embedded task database")?;

    let outbox = OutboxSupervisor::init(
        &config.storage,
        pool.clone(),
        config.fanout.summary_cache_ttl_secs,
    )
    .await
    .context("initializing the outbox")?;

    let raw = match &config.storage.mongo_uri {
        Some(uri) => {
            match RawStore::connect(uri, &config.storage.mongo_db, &config.storage.raw_collection)
                .await
            {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    tracing::warn!(%err, "raw event store unreachable; continuing without it");
                    None
                }
            }
        }
        None => None,
    };

    let canonical = config
        .storage
        .canonical_url
        .clone()
        .map(|url| Arc::new(CanonicalClient::new(url)));

    let embeddings = Arc::new(EmbeddingClient::new(
        config.embedding.url.clone(),
        config.embedding.model.clone(),
        config.embedding.timeout_secs,
        config.embedding.dim,
        config.embedding.cache_capacity,
    ));

    let topics = Arc::new(TopicTree::load(config.storage.topic_tree_path.clone()).await);
    let recent = Arc::new(RecentRing::new(
        config.ingest.recent_capacity,
        config.ingest.recent_history_path.clone(),
    ));
    let rollups = Arc::new(RollupBuffer::new(config.rollup.flush_secs));
    let signal = Arc::new(FanoutSignal::new(config.fanout.signal_capacity));
    let fanout_health = Arc::new(FanoutHealth::default());

    // Sinks exist only for configured backends; ingest fans out to the
    // targets that have one.
    let mut sinks: HashMap<FanoutTarget, Arc<dyn FanoutSink>> = HashMap::new();
    if let Some(raw) = &raw {
        sinks.insert(
            FanoutTarget::Raw,
            Arc::new(RawEventSink::new(Arc::clone(raw))),
        );
    }
    if let Some(url) = &config.storage.vector_url {
        sinks.insert(
            FanoutTarget::Vector,
            Arc::new(VectorSink::new(
                url.clone(),
                config.storage.vector_collection.clone(),
                Arc::clone(&embeddings),
            )),
        );
    }
    if let Some(url) = &config.storage.analytic_url {
        sinks.insert(
            FanoutTarget::Analytic,
            Arc::new(AnalyticSink::new(
                url.clone(),
                config.storage.analytic_db.clone(),
                config.storage.analytic_table.clone(),
            )),
        );
    }
    if let Some(url) = &config.storage.archival_url {
        sinks.insert(
            FanoutTarget::Archival,
            Arc::new(ArchivalSink::new(url.clone())),
        );
    }
    if let Some(url) = &config.storage.observability_url {
        sinks.insert(
            FanoutTarget::Observability,
            Arc::new(ObservabilitySink::new(url.clone())),
        );
    }
    let enabled_targets: Vec<FanoutTarget> = FanoutTarget::ALL
        .into_iter()
        .filter(|target| sinks.contains_key(target))
        .collect();
    if enabled_targets.is_empty() {
        tracing::warn!("no fanout sinks configured; writes will only reach the canonical store");
    }

    let ingest = IngestService::new(
        &config,
        IngestDeps {
            outbox: Arc::clone(&outbox),
            signal: Arc::clone(&signal),
            health: Arc::clone(&fanout_health),
            raw: raw.clone(),
            canonical: canonical.clone(),
            topics: Arc::clone(&topics),
            rollups: Arc::clone(&rollups),
            recent: Arc::clone(&recent),
            enabled_targets,
        },
    );

    let feedback = Arc::new(
        FeedbackStore::init(pool.clone())
            .await
            .context("initializing the feedback store")?,
    );

    let mut sources: BTreeMap<SourceId, Arc<dyn RetrievalSource>> = BTreeMap::new();
    if let Some(url) = &config.storage.vector_url {
        sources.insert(
            SourceId::Vector,
            Arc::new(VectorSource::new(
                url.clone(),
                config.storage.vector_collection.clone(),
                Arc::clone(&embeddings),
            )),
        );
    }
    if let Some(raw) = &raw {
        sources.insert(
            SourceId::Raw,
            Arc::new(RawSource::new(Arc::clone(raw), config.retrieval.scan_cap)),
        );
    }
    if let Some(url) = &config.storage.analytic_url {
        sources.insert(
            SourceId::Analytic,
            Arc::new(AnalyticSource::new(
                url.clone(),
                config.storage.analytic_db.clone(),
                config.storage.analytic_table.clone(),
            )),
        );
    }
    if let Some(url) = &config.storage.archival_url {
        sources.insert(SourceId::Archival, Arc::new(ArchivalSource::new(url.clone())));
    }
    if let Some(canonical) = &canonical {
        sources.insert(
            SourceId::CanonicalLexical,
            Arc::new(CanonicalLexicalSource::new(
                Arc::clone(canonical),
                config.retrieval.project_file_cap,
                config.retrieval.total_file_cap,
            )),
        );
    }
    let retrieval = Arc::new(RetrievalEngine::new(
        sources,
        Some(Arc::clone(&feedback)),
        canonical.clone(),
        config.retrieval.clone(),
    ));

    let task_retry = RetryPolicy {
        base_secs: config.tasks.retry_base_secs,
        cap_secs: config.tasks.retry_cap_secs,
    };
    let tasks = Arc::new(
        TaskQueue::init(
            pool.clone(),
            canonical.clone(),
            config.tasks.lease_secs,
            config.tasks.default_max_attempts,
            task_retry,
        )
        .await
        .context("initializing the task queue")?,
    );

    let messaging = MessagingService::new(
        config.messaging.clone(),
        Arc::clone(&ingest),
        Arc::clone(&retrieval),
        Arc::clone(&tasks),
        Arc::clone(&outbox),
        config.tasks.allowed_actions.clone(),
        config.tasks.callback_hosts.clone(),
    );

    let retention = RetentionManager::new(
        config.retention.clone(),
        Arc::clone(&outbox),
        raw.clone(),
        config
            .storage
            .vector_url
            .clone()
            .map(|url| (url, config.storage.vector_collection.clone())),
        config.storage.archival_url.clone(),
    );

    let task_worker_health = Arc::new(TaskWorkerHealth::default());

    // Background machinery.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let fanout_ctx = Arc::new(FanoutContext {
        outbox: Arc::clone(&outbox),
        sinks,
        signal: Arc::clone(&signal),
        limiters: TargetRateLimiters::from_config(&config.fanout.rate_limits),
        health: Arc::clone(&fanout_health),
        retry_policy: RetryPolicy {
            base_secs: config.fanout.retry_base_secs,
            cap_secs: config.fanout.retry_cap_secs,
        },
        config: config.fanout.clone(),
    });
    handles.extend(spawn_workers(fanout_ctx, shutdown_rx.clone()));

    let executor = Arc::new(ActionExecutor::new(
        Arc::clone(&ingest),
        Arc::clone(&retrieval),
        Arc::clone(&messaging),
        config.chat.clone(),
        config.tasks.allowed_actions.clone(),
        config.tasks.callback_hosts.clone(),
    ));
    handles.extend(spawn_task_workers(
        Arc::clone(&tasks),
        executor,
        Arc::clone(&task_worker_health),
        config.tasks.workers,
        config.tasks.poll_interval_secs,
        shutdown_rx.clone(),
    ));

    handles.extend(spawn_retention_workers(
        Arc::clone(&retention),
        Arc::clone(&outbox),
        config.retention.stale_running_secs,
        shutdown_rx.clone(),
    ));

    // Rollup flusher.
    {
        let ingest = Arc::clone(&ingest);
        let mut shutdown = shutdown_rx.clone();
        let interval = std::time::Duration::from_secs_f64(config.rollup.flush_secs.max(1.0));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                    _ = tokio::time::sleep(interval) => {
                        let result = ingest.flush_rollups(false).await;
                        if result["flushed"].as_u64().unwrap_or(0) > 0 {
                            tracing::debug!(target: "lattice::rollup", %result, "rollup flush");
                        }
                    }
                }
            }
        }));
    }

    let state = AppState {
        config,
        ingest,
        retrieval,
        outbox,
        tasks,
        feedback,
        messaging,
        retention,
        topics,
        recent,
        canonical,
        fanout_health,
        signal,
        task_worker_health,
    };
    Ok((
        state,
        BackgroundWorkers {
            shutdown: shutdown_tx,
            handles,
        },
    ))
}
