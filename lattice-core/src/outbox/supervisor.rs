//! Backend selection and lifecycle for the outbox.
//!
//! The supervisor owns the active [`OutboxStore`]. Selection happens once at
//! startup (with demotion to sqlite when the document backend fails to
//! init); afterwards a disk-integrity error from the embedded backend may
//! trigger at most one promotion to the document backend for the remainder
//! of the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use sqlx::sqlite::SqlitePool;

use lattice_config::{OutboxBackendKind, StorageConfig};

use crate::error::{LatticeError, Result};

use super::{
    ClaimFilter, EnqueueOptions, EnqueueOutcome, EventEnvelope, FanoutTarget, GcParams, GcResult,
    JobStatus, MongoOutbox, OutboxJob, OutboxStore, OutboxSummary, RetryPolicy, SqliteOutbox,
};

#[derive(Debug, Clone)]
struct MongoTarget {
    uri: String,
    db: String,
    collection: String,
}

pub struct OutboxSupervisor {
    store: RwLock<Arc<dyn OutboxStore>>,
    promotion_attempted: AtomicBool,
    allow_promotion: bool,
    mongo: Option<MongoTarget>,
    summary_ttl_secs: f64,
    // Shared with the background refresh task, which outlives the borrow
    // that scheduled it.
    summary_cache: Arc<Mutex<Option<(Instant, OutboxSummary)>>>,
    refresh_in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for OutboxSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxSupervisor")
            .field("backend", &self.active_backend())
            .finish()
    }
}

impl OutboxSupervisor {
    pub async fn init(
        storage: &StorageConfig,
        pool: SqlitePool,
        summary_ttl_secs: f64,
    ) -> Result<Arc<Self>> {
        let mongo = storage.mongo_uri.as_ref().map(|uri| MongoTarget {
            uri: uri.clone(),
            db: storage.mongo_db.clone(),
            collection: storage.outbox_collection.clone(),
        });

        let store: Arc<dyn OutboxStore> = match (storage.outbox_backend, &mongo) {
            (OutboxBackendKind::Mongo, Some(target)) => {
                match MongoOutbox::connect(&target.uri, &target.db, &target.collection).await {
                    Ok(backend) => Arc::new(backend),
                    Err(err) if storage.allow_demotion => {
                        tracing::warn!(
                            target: "lattice::outbox",
                            %err,
                            "document outbox init failed; demoting to sqlite"
                        );
                        Arc::new(SqliteOutbox::init(pool.clone()).await?)
                    }
                    Err(err) => return Err(err),
                }
            }
            (OutboxBackendKind::Mongo, None) => {
                tracing::warn!(
                    target: "lattice::outbox",
                    "mongo backend selected without MONGO_URI; using sqlite"
                );
                Arc::new(SqliteOutbox::init(pool.clone()).await?)
            }
            (OutboxBackendKind::Sqlite, _) => Arc::new(SqliteOutbox::init(pool.clone()).await?),
        };

        Ok(Arc::new(Self {
            store: RwLock::new(store),
            promotion_attempted: AtomicBool::new(false),
            allow_promotion: storage.allow_promotion,
            mongo,
            summary_ttl_secs,
            summary_cache: Arc::new(Mutex::new(None)),
            refresh_in_flight: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn store(&self) -> Arc<dyn OutboxStore> {
        self.store.read().expect("outbox store lock poisoned").clone()
    }

    pub fn active_backend(&self) -> &'static str {
        self.store().kind()
    }

    /// One-shot promotion to the document backend. Returns true when the
    /// active store changed.
    async fn try_promote(&self, cause: &LatticeError) -> bool {
        if !self.allow_promotion || self.store().kind() == "mongo" {
            return false;
        }
        let Some(target) = self.mongo.clone() else {
            return false;
        };
        if self.promotion_attempted.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::warn!(
            target: "lattice::outbox",
            %cause,
            "embedded outbox reported a disk integrity error; promoting to document backend"
        );
        match MongoOutbox::connect(&target.uri, &target.db, &target.collection).await {
            Ok(backend) => {
                *self.store.write().expect("outbox store lock poisoned") = Arc::new(backend);
                true
            }
            Err(err) => {
                tracing::error!(target: "lattice::outbox", %err, "outbox promotion failed");
                false
            }
        }
    }

    pub async fn enqueue(
        &self,
        envelope: &EventEnvelope,
        targets: &[FanoutTarget],
        opts: &EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        match self.store().enqueue(envelope, targets, opts).await {
            Err(err) => {
                if err.is_disk_integrity() && self.try_promote(&err).await {
                    self.store().enqueue(envelope, targets, opts).await
                } else {
                    Err(err)
                }
            }
            ok => ok,
        }
    }

    pub async fn claim_batch(&self, limit: u32, filter: ClaimFilter) -> Result<Vec<OutboxJob>> {
        match self.store().claim_batch(limit, filter).await {
            Err(err) => {
                if err.is_disk_integrity() && self.try_promote(&err).await {
                    self.store().claim_batch(limit, filter).await
                } else {
                    Err(err)
                }
            }
            ok => ok,
        }
    }

    pub async fn mark_success(&self, id: i64) -> Result<()> {
        self.store().mark_success(id).await
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.store().mark_failed(id, error).await
    }

    pub async fn mark_retry(
        &self,
        job: &OutboxJob,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<()> {
        self.store().mark_retry(job, error, policy).await
    }

    pub async fn recover_stale_running(&self, max_age_secs: u64) -> Result<u64> {
        self.store().recover_stale_running(max_age_secs).await
    }

    pub async fn gc(&self, params: &GcParams) -> Result<GcResult> {
        self.store().gc(params).await
    }

    pub async fn list_jobs(
        &self,
        statuses: &[JobStatus],
        target: Option<FanoutTarget>,
        limit: u32,
    ) -> Result<Vec<OutboxJob>> {
        self.store().list_jobs(statuses, target, limit).await
    }

    /// Cached status summary. Fresh entries are served as-is; a stale entry
    /// is returned immediately while a background refresh repopulates the
    /// cache; an empty cache refreshes inline.
    pub async fn summary_cached(&self) -> OutboxSummary {
        let cached = {
            let cache = self.summary_cache.lock().expect("summary cache poisoned");
            cache.clone()
        };
        match cached {
            Some((at, summary)) if at.elapsed().as_secs_f64() < self.summary_ttl_secs => summary,
            Some((_, summary)) => {
                self.schedule_summary_refresh();
                summary
            }
            None => self.refresh_summary().await.unwrap_or_default(),
        }
    }

    fn schedule_summary_refresh(&self) {
        if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.store();
        let cache = Arc::clone(&self.summary_cache);
        let in_flight = Arc::clone(&self.refresh_in_flight);
        tokio::spawn(async move {
            match store.summary().await {
                Ok(summary) => {
                    let mut cache = cache.lock().expect("summary cache poisoned");
                    *cache = Some((Instant::now(), summary));
                }
                Err(err) => {
                    tracing::warn!(target: "lattice::outbox", %err, "summary refresh failed");
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        });
    }

    pub async fn refresh_summary(&self) -> Result<OutboxSummary> {
        let summary = self.store().summary().await?;
        let mut cache = self.summary_cache.lock().expect("summary cache poisoned");
        *cache = Some((Instant::now(), summary.clone()));
        Ok(summary)
    }

    /// Force the next `summary_cached` call to hit the backend.
    pub fn invalidate_summary(&self) {
        let mut cache = self.summary_cache.lock().expect("summary cache poisoned");
        *cache = None;
    }
}
