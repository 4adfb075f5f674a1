//! The memory-write pipeline: secret policy, dedup, raw persistence, topic
//! bookkeeping, hot-file rollups, admission control, and outbox fanout.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use lattice_config::{
    AdmissionConfig, CanonicalWriteMode, FanoutConfig, IngestConfig, RetentionConfig,
    RollupConfig, SecretsConfig,
};

use crate::canonical::CanonicalClient;
use crate::dedup::{DedupWindow, LatestHashMap};
use crate::error::{LatticeError, Result};
use crate::event::MemoryEvent;
use crate::fanout::{FanoutHealth, FanoutSignal};
use crate::outbox::{
    EnqueueOptions, EventEnvelope, FanoutTarget, OutboxSupervisor,
};
use crate::raw_store::RawStore;
use crate::recent::RecentRing;
use crate::retention::is_low_value_record;
use crate::rollup::{RollupBuffer, RollupInput};
use crate::secrets;
use crate::topics::TopicTree;

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub project: String,
    pub file: String,
    pub content: String,
    pub topic_path: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub ok: bool,
    pub event_id: String,
    pub warnings: Vec<String>,
    pub fanout: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_hash_unchanged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup_buffered: Option<bool>,
}

impl WriteOutcome {
    fn accepted(event_id: String) -> Self {
        Self {
            ok: true,
            event_id,
            warnings: Vec::new(),
            fanout: BTreeMap::new(),
            deduped: None,
            latest_hash_unchanged: None,
            rollup_buffered: None,
        }
    }
}

#[derive(Debug, Clone)]
struct CanonicalWrite {
    project: String,
    file: String,
    content: String,
}

pub struct IngestService {
    secrets: SecretsConfig,
    rollup_cfg: RollupConfig,
    admission: AdmissionConfig,
    retention: RetentionConfig,
    fanout_cfg: FanoutConfig,
    ingest_cfg: IngestConfig,
    outbox: Arc<OutboxSupervisor>,
    signal: Arc<FanoutSignal>,
    health: Arc<FanoutHealth>,
    raw: Option<Arc<RawStore>>,
    canonical: Option<Arc<CanonicalClient>>,
    canonical_tx: Option<mpsc::Sender<CanonicalWrite>>,
    topics: Arc<TopicTree>,
    dedup: DedupWindow,
    latest: LatestHashMap,
    rollups: Arc<RollupBuffer>,
    recent: Arc<RecentRing>,
    enabled_targets: Vec<FanoutTarget>,
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("targets", &self.enabled_targets)
            .finish()
    }
}

/// The shared subsystems the ingest pipeline drives.
pub struct IngestDeps {
    pub outbox: Arc<OutboxSupervisor>,
    pub signal: Arc<FanoutSignal>,
    pub health: Arc<FanoutHealth>,
    pub raw: Option<Arc<RawStore>>,
    pub canonical: Option<Arc<CanonicalClient>>,
    pub topics: Arc<TopicTree>,
    pub rollups: Arc<RollupBuffer>,
    pub recent: Arc<RecentRing>,
    pub enabled_targets: Vec<FanoutTarget>,
}

impl IngestService {
    pub fn new(config: &lattice_config::LatticeConfig, deps: IngestDeps) -> Arc<Self> {
        let ingest_cfg = config.ingest.clone();
        let rollup_cfg = config.rollup.clone();
        let canonical_tx = match (&deps.canonical, ingest_cfg.canonical_write_mode) {
            (Some(client), CanonicalWriteMode::Async) => {
                let (tx, rx) = mpsc::channel(ingest_cfg.canonical_queue_capacity);
                spawn_canonical_writer(Arc::clone(client), rx);
                Some(tx)
            }
            _ => None,
        };
        Arc::new(Self {
            dedup: DedupWindow::new(rollup_cfg.dedup_window_secs, rollup_cfg.dedup_max_keys),
            latest: LatestHashMap::new(rollup_cfg.latest_hash_max_keys),
            secrets: config.secrets.clone(),
            rollup_cfg,
            admission: config.admission.clone(),
            retention: config.retention.clone(),
            fanout_cfg: config.fanout.clone(),
            ingest_cfg,
            outbox: deps.outbox,
            signal: deps.signal,
            health: deps.health,
            raw: deps.raw,
            canonical: deps.canonical,
            canonical_tx,
            topics: deps.topics,
            rollups: deps.rollups,
            recent: deps.recent,
            enabled_targets: deps.enabled_targets,
        })
    }

    pub fn enabled_targets(&self) -> &[FanoutTarget] {
        &self.enabled_targets
    }

    fn is_hot_file(&self, file: &str) -> bool {
        self.rollup_cfg
            .hot_suffixes
            .iter()
            .any(|suffix| file.ends_with(suffix))
    }

    pub async fn write(&self, request: WriteRequest) -> Result<WriteOutcome> {
        let mut warnings = Vec::new();

        let (stored, secret_warning) =
            secrets::apply_storage_policy(&request.content, self.secrets.storage_mode)?;
        if let Some(warning) = secret_warning {
            warnings.push(warning);
        }

        let event = MemoryEvent::build(
            &request.project,
            &request.file,
            stored,
            request.topic_path.as_deref(),
            request.request_id.clone(),
            self.ingest_cfg.summary_max_chars,
        )?;

        let hot = self.is_hot_file(&event.file);

        // Hot-file short-circuit: unchanged latest snapshots produce no new
        // information for any sink.
        if hot
            && self
                .latest
                .is_unchanged(&event.project, &event.file, &event.content_hash)
        {
            if let Some(raw) = &self.raw
                && let Err(err) = raw.persist_event(&event).await
            {
                tracing::debug!(target: "lattice::ingest", %err, "raw upsert for unchanged hot file failed");
            }
            self.recent.push(&event, true).await;
            let mut outcome = WriteOutcome::accepted(event.event_id);
            outcome.warnings = warnings;
            outcome.deduped = Some(true);
            outcome.latest_hash_unchanged = Some(true);
            return Ok(outcome);
        }

        // Sliding-window dedup of identical payloads.
        let dedupe_key = DedupWindow::key(&event.project, &event.file, &event.content_hash);
        if self.dedup.should_skip(&dedupe_key) {
            self.recent.push(&event, true).await;
            let mut outcome = WriteOutcome::accepted(event.event_id);
            outcome.warnings = warnings;
            outcome.deduped = Some(true);
            return Ok(outcome);
        }

        // Synchronous best-effort raw persistence; failure keeps the raw
        // target in the fanout set instead.
        let mut raw_persisted = false;
        if let Some(raw) = &self.raw {
            match raw.persist_event(&event).await {
                Ok(()) => raw_persisted = true,
                Err(err) => {
                    warnings.push("raw store write failed; queued for fanout retry".to_string());
                    tracing::warn!(target: "lattice::ingest", %err, "raw persist failed");
                }
            }
        }

        if let Err(err) = self.topics.record(&event.project, &event.topic_path).await {
            tracing::warn!(target: "lattice::ingest", %err, "topic tree update failed");
        }
        self.recent.push(&event, false).await;

        // Hot-file rollup: buffer and let the flusher synthesize one write
        // per interval instead of fanning out every sample.
        if hot && self.rollup_cfg.enabled {
            self.rollups.enqueue(RollupInput {
                project: event.project.clone(),
                file: event.file.clone(),
                summary: event.summary.clone(),
                topic_path: event.topic_path.clone(),
                topic_tags: event.topic_tags.clone(),
                content_hash: event.content_hash.clone(),
                content_length: event.content_length,
            });
            let mut outcome = WriteOutcome::accepted(event.event_id);
            outcome.warnings = warnings;
            outcome.rollup_buffered = Some(true);
            return Ok(outcome);
        }

        self.enqueue_canonical(&event.project, &event.file, &event.content_raw, &mut warnings)
            .await?;

        // Target set: skip raw when the synchronous persist already landed,
        // and apply archival admission control.
        let mut targets: Vec<FanoutTarget> = self
            .enabled_targets
            .iter()
            .copied()
            .filter(|target| !(raw_persisted && *target == FanoutTarget::Raw))
            .collect();
        let mut fanout: BTreeMap<String, String> = BTreeMap::new();
        if raw_persisted && self.enabled_targets.contains(&FanoutTarget::Raw) {
            fanout.insert("raw".to_string(), "persisted".to_string());
        }
        if targets.contains(&FanoutTarget::Archival)
            && let Some(reason) = self.archival_admission_reason(&event).await
        {
            targets.retain(|target| *target != FanoutTarget::Archival);
            fanout.insert("archival".to_string(), "admission_dropped".to_string());
            warnings.push(format!("archival enqueue dropped: {reason}"));
            self.health
                .admission_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let envelope = EventEnvelope::from(&event);
        let opts = EnqueueOptions {
            force_requeue: false,
            coalesce_window_secs: self.fanout_cfg.coalesce_window_secs,
            coalesce_targets: self
                .fanout_cfg
                .coalesce_targets
                .iter()
                .filter_map(|name| FanoutTarget::parse(name))
                .collect(),
            max_attempts: self.fanout_cfg.max_attempts,
        };
        let enqueue = self.outbox.enqueue(&envelope, &targets, &opts).await?;
        self.health
            .coalesced_total
            .fetch_add(enqueue.coalesced, std::sync::atomic::Ordering::Relaxed);
        for target in &targets {
            fanout.insert(target.as_str().to_string(), "queued".to_string());
        }
        for (target, _) in &enqueue.coalesced_by_target {
            fanout.insert(target.clone(), "coalesced".to_string());
        }
        if enqueue.existing > 0 {
            warnings.push(format!(
                "{} fanout row(s) already queued for this event",
                enqueue.existing
            ));
        }
        self.signal.notify();
        self.outbox.invalidate_summary();

        let mut outcome = WriteOutcome::accepted(event.event_id);
        outcome.warnings = warnings;
        outcome.fanout = fanout;
        outcome.deduped = Some(false);
        Ok(outcome)
    }

    /// Returns the drop reason when the archival backlog refuses this event.
    async fn archival_admission_reason(&self, event: &MemoryEvent) -> Option<String> {
        if !self.admission.enabled {
            return None;
        }
        let summary = self.outbox.summary_cached().await;
        let backlog = summary.outstanding_for(FanoutTarget::Archival);
        if backlog >= self.admission.hard_limit {
            return Some(format!("hard_backlog ({backlog} outstanding)"));
        }
        if backlog >= self.admission.soft_limit
            && is_low_value_record(
                &event.file,
                &event.topic_path,
                &event.summary,
                &event.source_kind,
                true,
                &self.retention.low_value_suffixes,
                &self.retention.low_value_prefixes,
                self.admission.min_summary_chars,
            )
        {
            return Some(format!("soft_backlog_low_value ({backlog} outstanding)"));
        }
        None
    }

    async fn enqueue_canonical(
        &self,
        project: &str,
        file: &str,
        content: &str,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        match (&self.canonical_tx, &self.canonical) {
            (Some(tx), _) => {
                let write = CanonicalWrite {
                    project: project.to_string(),
                    file: file.to_string(),
                    content: content.to_string(),
                };
                tx.try_send(write).map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => LatticeError::QueueSaturation(
                        "canonical write queue is full".to_string(),
                    ),
                    mpsc::error::TrySendError::Closed(_) => {
                        LatticeError::internal("canonical writer is not running")
                    }
                })?;
            }
            (None, Some(client)) => {
                if let Err(err) = client.write_file(project, file, content).await {
                    warnings.push(format!("canonical write failed: {err}"));
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Drain due rollup entries into canonical writes. `force` flushes
    /// everything regardless of interval (shutdown path).
    pub async fn flush_rollups(&self, force: bool) -> serde_json::Value {
        let emissions = self.rollups.drain_due(force);
        let mut flushed = 0usize;
        let mut errors = 0usize;
        for emission in emissions {
            let mut warnings = Vec::new();
            match self
                .enqueue_canonical(
                    &emission.project,
                    &emission.file,
                    &emission.content,
                    &mut warnings,
                )
                .await
            {
                Ok(()) if warnings.is_empty() => flushed += 1,
                Ok(()) => {
                    errors += 1;
                    self.rollups.record_error(warnings.join("; "));
                }
                Err(err) => {
                    errors += 1;
                    self.rollups.record_error(err.to_string());
                }
            }
        }
        serde_json::json!({"flushed": flushed, "errors": errors})
    }

    pub fn rollup_health(&self) -> serde_json::Value {
        serde_json::to_value(self.rollups.health()).unwrap_or(serde_json::Value::Null)
    }
}

fn spawn_canonical_writer(client: Arc<CanonicalClient>, mut rx: mpsc::Receiver<CanonicalWrite>) {
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            if let Err(err) = client
                .write_file(&write.project, &write.file, &write.content)
                .await
            {
                tracing::warn!(
                    target: "lattice::ingest",
                    project = %write.project,
                    file = %write.file,
                    %err,
                    "canonical write failed"
                );
            }
        }
    });
}
