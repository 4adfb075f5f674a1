//! Retention: outbox GC on a timer, plus low-value sweeps across the sinks
//! that accumulate per-event records.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lattice_config::RetentionConfig;

use crate::outbox::{FanoutTarget, GcParams, GcResult, OutboxSupervisor};
use crate::raw_store::RawStore;

/// Low-value classifier shared by admission control and the sink sweepers.
///
/// A record is low-value when its file suffix, topic prefix, or source kind
/// marks it as churn, or (in strict modes) when a churn-like extension
/// carries only a short summary.
pub fn is_low_value_record(
    file: &str,
    topic_path: &str,
    summary: &str,
    source_kind: &str,
    include_short_summary: bool,
    suffixes: &[String],
    prefixes: &[String],
    min_summary_chars: usize,
) -> bool {
    if source_kind == "high_frequency_rollup" {
        return true;
    }
    if suffixes.iter().any(|suffix| file.ends_with(suffix.as_str())) {
        return true;
    }
    if prefixes.iter().any(|prefix| {
        topic_path == prefix.as_str() || topic_path.starts_with(&format!("{prefix}/"))
    }) {
        return true;
    }
    if include_short_summary
        && summary.chars().count() < min_summary_chars
        && [".json", ".ndjson", ".log"]
            .iter()
            .any(|ext| file.ends_with(ext))
    {
        return true;
    }
    false
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepState {
    pub runs: u64,
    pub last_run_at: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_deleted: u64,
    pub last_error: Option<String>,
    pub last_result: Option<Value>,
}

pub struct RetentionManager {
    config: RetentionConfig,
    outbox: Arc<OutboxSupervisor>,
    raw: Option<Arc<RawStore>>,
    vector: Option<VectorRetention>,
    archival: Option<ArchivalRetention>,
    gc_state: Mutex<SweepState>,
    sink_state: Mutex<SweepState>,
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager").finish()
    }
}

impl RetentionManager {
    pub fn new(
        config: RetentionConfig,
        outbox: Arc<OutboxSupervisor>,
        raw: Option<Arc<RawStore>>,
        vector_url: Option<(String, String)>,
        archival_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            raw,
            vector: vector_url.map(|(url, collection)| VectorRetention::new(url, collection)),
            archival: archival_url.map(ArchivalRetention::new),
            config,
            gc_state: Mutex::new(SweepState::default()),
            sink_state: Mutex::new(SweepState::default()),
        })
    }

    fn gc_params(&self) -> GcParams {
        GcParams {
            succeeded_hours: self.config.succeeded_hours,
            failed_hours: self.config.failed_hours,
            stale_pending_hours: self.config.stale_pending_hours,
            stale_targets: self
                .config
                .stale_targets
                .iter()
                .filter_map(|name| FanoutTarget::parse(name))
                .collect(),
            vacuum: self.config.gc_vacuum,
            vacuum_min_deleted: self.config.gc_vacuum_min_deleted,
            min_vacuum_interval_secs: self.config.gc_min_vacuum_interval_secs,
        }
    }

    pub async fn run_outbox_gc_once(&self) -> crate::error::Result<GcResult> {
        let started = Instant::now();
        let outcome = self.outbox.gc(&self.gc_params()).await;
        let mut state = self.gc_state.lock().expect("gc state lock poisoned");
        state.runs += 1;
        state.last_run_at = Some(crate::event::now_iso());
        state.last_duration_ms = Some(started.elapsed().as_millis() as u64);
        match &outcome {
            Ok(result) => {
                state.last_deleted = result.deleted.total;
                state.last_error = None;
                state.last_result = serde_json::to_value(result).ok();
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
            }
        }
        outcome
    }

    /// Run the three sink pruners in parallel under individual timeouts.
    /// One sink failing never fails the run; its error is reported.
    pub async fn run_sink_retention_once(&self) -> Value {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.sink_timeout_secs.max(1));
        let mut sinks = serde_json::Map::new();
        let mut errors = serde_json::Map::new();

        let raw_future = self.prune_raw();
        let vector_future = self.prune_vector();
        let archival_future = self.prune_archival();
        let (raw, vector, archival) = tokio::join!(
            tokio::time::timeout(timeout, raw_future),
            tokio::time::timeout(timeout, vector_future),
            tokio::time::timeout(timeout, archival_future),
        );

        let mut record = |name: &str, outcome: std::result::Result<crate::error::Result<Value>, tokio::time::error::Elapsed>| {
            match outcome {
                Ok(Ok(result)) => {
                    sinks.insert(name.to_string(), result);
                }
                Ok(Err(err)) => {
                    errors.insert(name.to_string(), Value::String(err.to_string()));
                }
                Err(_) => {
                    errors.insert(name.to_string(), Value::String("timed out".to_string()));
                }
            }
        };
        record("raw", raw);
        record("vector", vector);
        record("archival", archival);

        let deleted_total: u64 = sinks
            .values()
            .filter_map(|sink| sink["deleted"].as_u64())
            .sum();
        let ok = errors.is_empty();
        let result = json!({
            "ok": ok,
            "sinks": sinks,
            "errors": errors,
            "deleted_total": deleted_total,
            "duration_ms": started.elapsed().as_millis() as u64,
        });

        let mut state = self.sink_state.lock().expect("sink state lock poisoned");
        state.runs += 1;
        state.last_run_at = Some(crate::event::now_iso());
        state.last_duration_ms = Some(started.elapsed().as_millis() as u64);
        state.last_deleted = deleted_total;
        state.last_error = (!ok).then(|| {
            errors
                .iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect::<Vec<_>>()
                .join("; ")
        });
        state.last_result = Some(result.clone());
        result
    }

    async fn prune_raw(&self) -> crate::error::Result<Value> {
        let Some(raw) = &self.raw else {
            return Ok(json!({"enabled": false, "deleted": 0}));
        };
        let scanned = raw.scan_oldest(self.config.sink_scan_cap).await?;
        let low_value_ids: Vec<String> = scanned
            .iter()
            .filter(|doc| {
                is_low_value_record(
                    &doc.file,
                    &doc.topic_path,
                    &doc.summary,
                    &doc.source_kind,
                    false,
                    &self.config.low_value_suffixes,
                    &self.config.low_value_prefixes,
                    self.config.min_summary_chars,
                )
            })
            .take(self.config.sink_delete_cap as usize)
            .map(|doc| doc.event_id.clone())
            .collect();
        let deleted = raw.delete_by_event_ids(&low_value_ids).await?;
        Ok(json!({"enabled": true, "scanned": scanned.len(), "deleted": deleted}))
    }

    async fn prune_vector(&self) -> crate::error::Result<Value> {
        let Some(vector) = &self.vector else {
            return Ok(json!({"enabled": false, "deleted": 0}));
        };
        vector.delete_low_value(&self.config).await
    }

    async fn prune_archival(&self) -> crate::error::Result<Value> {
        let Some(archival) = &self.archival else {
            return Ok(json!({"enabled": false, "deleted": 0}));
        };
        archival
            .delete_low_value(&self.config.low_value_prefixes, self.config.sink_delete_cap)
            .await
    }

    pub fn status(&self) -> Value {
        json!({
            "gc": self.gc_state.lock().expect("gc state lock poisoned").clone(),
            "sinks": self.sink_state.lock().expect("sink state lock poisoned").clone(),
            "thresholds": self.config,
        })
    }
}

/// Scrolls stored points, classifies their payloads, and deletes low-value
/// ids in one bounded batch, mirroring the raw-store pruner.
struct VectorRetention {
    http: reqwest::Client,
    url: String,
    collection: String,
}

impl VectorRetention {
    fn new(url: String, collection: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            collection,
        }
    }

    async fn delete_low_value(&self, config: &RetentionConfig) -> crate::error::Result<Value> {
        let base = format!(
            "{}/collections/{}",
            self.url.trim_end_matches('/'),
            self.collection
        );

        let scroll = self
            .http
            .post(format!("{base}/points/scroll"))
            .json(&json!({
                "limit": config.sink_scan_cap,
                "with_payload": true,
            }))
            .send()
            .await?;
        if !scroll.status().is_success() {
            return Err(crate::error::LatticeError::upstream(format!(
                "vector retention scroll status {}",
                scroll.status()
            )));
        }
        let parsed: Value = scroll.json().await?;
        let points = parsed["result"]["points"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let low_value_ids: Vec<Value> = points
            .iter()
            .filter(|point| {
                let payload = &point["payload"];
                is_low_value_record(
                    payload["file"].as_str().unwrap_or(""),
                    payload["topic_path"].as_str().unwrap_or(""),
                    payload["summary"].as_str().unwrap_or(""),
                    payload["source_kind"].as_str().unwrap_or(""),
                    false,
                    &config.low_value_suffixes,
                    &config.low_value_prefixes,
                    config.min_summary_chars,
                )
            })
            .take(config.sink_delete_cap as usize)
            .map(|point| point["id"].clone())
            .collect();

        if low_value_ids.is_empty() {
            return Ok(json!({"enabled": true, "scanned": points.len(), "deleted": 0}));
        }

        let deleted = low_value_ids.len() as u64;
        let delete = self
            .http
            .post(format!("{base}/points/delete?wait=true"))
            .json(&json!({"points": low_value_ids}))
            .send()
            .await?;
        if !delete.status().is_success() {
            return Err(crate::error::LatticeError::upstream(format!(
                "vector retention delete status {}",
                delete.status()
            )));
        }
        Ok(json!({"enabled": true, "scanned": points.len(), "deleted": deleted}))
    }
}

/// Searches archival passages tagged with low-value topics and deletes them
/// in bounded batches.
struct ArchivalRetention {
    http: reqwest::Client,
    url: String,
}

impl ArchivalRetention {
    fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    async fn delete_low_value(
        &self,
        prefixes: &[String],
        delete_cap: u32,
    ) -> crate::error::Result<Value> {
        let base = self.url.trim_end_matches('/');
        let mut deleted = 0u64;
        for prefix in prefixes {
            if deleted >= delete_cap as u64 {
                break;
            }
            let response = self
                .http
                .post(format!("{base}/v1/passages/search"))
                .json(&json!({
                    "query": "",
                    "tags": [format!("topic:{prefix}")],
                    "limit": delete_cap,
                }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(crate::error::LatticeError::upstream(format!(
                    "archival retention search status {}",
                    response.status()
                )));
            }
            let parsed: Value = response.json().await?;
            let passages = parsed["passages"]
                .as_array()
                .or_else(|| parsed.as_array())
                .cloned()
                .unwrap_or_default();
            for passage in passages {
                if deleted >= delete_cap as u64 {
                    break;
                }
                let Some(id) = passage["id"].as_str() else {
                    continue;
                };
                let delete = self
                    .http
                    .delete(format!("{base}/v1/passages/{id}"))
                    .send()
                    .await?;
                if delete.status().is_success() {
                    deleted += 1;
                }
            }
        }
        Ok(json!({"enabled": true, "deleted": deleted}))
    }
}

/// Interval workers: outbox GC, sink retention, and stale-running recovery.
pub fn spawn_retention_workers(
    manager: Arc<RetentionManager>,
    outbox: Arc<OutboxSupervisor>,
    stale_running_secs: u64,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let manager = Arc::clone(&manager);
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(manager.config.gc_interval_secs.max(60));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                    _ = tokio::time::sleep(interval) => {
                        match manager.run_outbox_gc_once().await {
                            Ok(result) => debug!(
                                target: "lattice::retention",
                                deleted = result.deleted.total,
                                "outbox gc completed"
                            ),
                            Err(err) => warn!(target: "lattice::retention", %err, "outbox gc failed"),
                        }
                    }
                }
            }
        }));
    }

    {
        let manager = Arc::clone(&manager);
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(manager.config.sink_interval_secs.max(60));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                    _ = tokio::time::sleep(interval) => {
                        let result = manager.run_sink_retention_once().await;
                        debug!(
                            target: "lattice::retention",
                            ok = result["ok"].as_bool().unwrap_or(false),
                            "sink retention completed"
                        );
                    }
                }
            }
        }));
    }

    {
        let mut shutdown = shutdown.clone();
        let max_age = stale_running_secs.max(30);
        let interval = Duration::from_secs((max_age / 2).max(15));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { break },
                    _ = tokio::time::sleep(interval) => {
                        match outbox.recover_stale_running(max_age).await {
                            Ok(0) => {}
                            Ok(recovered) => warn!(
                                target: "lattice::retention",
                                recovered,
                                "stale running outbox rows recovered"
                            ),
                            Err(err) => warn!(target: "lattice::retention", %err, "stale recovery failed"),
                        }
                    }
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        vec!["__latest.json".to_string(), ".tmp".to_string()]
    }

    fn prefixes() -> Vec<String> {
        vec!["telemetry".to_string(), "signals/live".to_string()]
    }

    #[test]
    fn classifier_matches_suffix_prefix_and_kind() {
        assert!(is_low_value_record(
            "telemetry/queue__latest.json",
            "telemetry",
            "queue depth",
            "memory_write",
            true,
            &suffixes(),
            &prefixes(),
            80,
        ));
        assert!(is_low_value_record(
            "notes/flow.md",
            "signals/live",
            "signal update",
            "memory_write",
            false,
            &suffixes(),
            &prefixes(),
            80,
        ));
        assert!(is_low_value_record(
            "notes/rollup.json",
            "notes",
            "short",
            "high_frequency_rollup",
            false,
            &suffixes(),
            &prefixes(),
            80,
        ));
        assert!(!is_low_value_record(
            "decisions/rfc.md",
            "decisions",
            "Long-form decision artifact",
            "memory_write",
            false,
            &suffixes(),
            &prefixes(),
            80,
        ));
    }

    #[test]
    fn short_summary_only_counts_in_strict_mode() {
        let churny = is_low_value_record(
            "metrics/sample.json",
            "metrics",
            "tiny",
            "memory_write",
            true,
            &suffixes(),
            &prefixes(),
            80,
        );
        assert!(churny);
        let lax = is_low_value_record(
            "metrics/sample.json",
            "metrics",
            "tiny",
            "memory_write",
            false,
            &suffixes(),
            &prefixes(),
            80,
        );
        assert!(!lax);
    }
}
