//! Fanout worker pool. Each worker waits on the wake signal (bounded by the
//! poll interval), claims a batch, and dispatches per-target chunks through
//! backpressure, rate limiting, and target-specific error classification.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use lattice_config::FanoutConfig;

use crate::outbox::{ClaimFilter, FanoutTarget, JobStatus, OutboxJob, OutboxSupervisor, RetryPolicy};

use super::sinks::{FanoutSink, SinkError, SinkErrorKind};
use super::{FanoutHealth, FanoutSignal, TargetRateLimiters, backpressure_sleep_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    /// Serves every target except archival.
    General,
    /// Dedicated small pool for the archival store's throughput profile.
    Archival,
}

pub struct FanoutContext {
    pub outbox: Arc<OutboxSupervisor>,
    pub sinks: HashMap<FanoutTarget, Arc<dyn FanoutSink>>,
    pub signal: Arc<FanoutSignal>,
    pub limiters: TargetRateLimiters,
    pub health: Arc<FanoutHealth>,
    pub retry_policy: RetryPolicy,
    pub config: FanoutConfig,
}

impl std::fmt::Debug for FanoutContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutContext")
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub fn spawn_workers(
    ctx: Arc<FanoutContext>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let archival_pool = ctx.config.archival_workers;
    for worker_id in 0..ctx.config.workers {
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        // Without a dedicated archival pool the general workers cover it.
        let class = WorkerClass::General;
        let claim_all = archival_pool == 0;
        handles.push(tokio::spawn(async move {
            run_worker(ctx, class, claim_all, worker_id, shutdown).await;
        }));
    }
    for worker_id in 0..archival_pool {
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            run_worker(ctx, WorkerClass::Archival, false, worker_id, shutdown).await;
        }));
    }
    handles
}

async fn run_worker(
    ctx: Arc<FanoutContext>,
    class: WorkerClass,
    claim_all: bool,
    worker_id: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let filter = match (class, claim_all) {
        (WorkerClass::General, true) => ClaimFilter::Any,
        (WorkerClass::General, false) => ClaimFilter::Excluding(FanoutTarget::Archival),
        (WorkerClass::Archival, _) => ClaimFilter::Only(FanoutTarget::Archival),
    };
    let poll = Duration::from_secs_f64(ctx.config.poll_interval_secs.max(0.05));
    debug!(target: "lattice::fanout", worker_id, ?class, "fanout worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ctx.signal.wait(poll) => {}
        }

        // Drain available work before going back to waiting.
        loop {
            if *shutdown.borrow() {
                break;
            }
            match ctx.outbox.claim_batch(ctx.config.batch_size, filter).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    let saturated = batch.len() as u32 >= ctx.config.batch_size;
                    process_batch(&ctx, batch).await;
                    if !saturated {
                        break;
                    }
                }
                Err(err) => {
                    error!(target: "lattice::fanout", worker_id, %err, "claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break;
                }
            }
        }
    }
    debug!(target: "lattice::fanout", worker_id, ?class, "fanout worker stopped");
}

async fn process_batch(ctx: &FanoutContext, batch: Vec<OutboxJob>) {
    let mut groups: BTreeMap<FanoutTarget, Vec<OutboxJob>> = BTreeMap::new();
    for job in batch {
        groups.entry(job.target).or_default().push(job);
    }

    for (target, jobs) in groups {
        let chunk_size = match target {
            FanoutTarget::Vector => ctx.config.bulk_size_vector,
            FanoutTarget::Analytic => ctx.config.bulk_size_analytic,
            _ => jobs.len().max(1),
        };
        for chunk in jobs.chunks(chunk_size) {
            apply_backpressure(ctx, target).await;
            ctx.limiters.acquire(target).await;
            dispatch_chunk(ctx, target, chunk).await;
        }
    }
}

async fn apply_backpressure(ctx: &FanoutContext, target: FanoutTarget) {
    if !ctx
        .config
        .backpressure_targets
        .iter()
        .any(|name| FanoutTarget::parse(name) == Some(target))
    {
        return;
    }
    let ratio = ctx.signal.depth_ratio();
    let sleep = backpressure_sleep_secs(
        ratio,
        ctx.config.backpressure_watermark,
        ctx.config.backpressure_max_sleep_secs,
    );
    if sleep > 0.0 {
        let sleeps = ctx
            .health
            .backpressure_sleeps
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if sleeps % 16 == 0 {
            warn!(
                target: "lattice::fanout",
                %target,
                ratio,
                sleep_secs = sleep,
                "backpressure engaged"
            );
        }
        tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
    }
}

async fn dispatch_chunk(ctx: &FanoutContext, target: FanoutTarget, chunk: &[OutboxJob]) {
    ctx.health
        .dispatched
        .fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);

    if target == FanoutTarget::Archival && ctx.health.is_archival_disabled() {
        fail_chunk(ctx, chunk, "archival runtime disabled").await;
        return;
    }
    let Some(sink) = ctx.sinks.get(&target) else {
        fail_chunk(ctx, chunk, &format!("no sink configured for target {target}")).await;
        return;
    };

    match sink.deliver(chunk).await {
        Ok(()) => {
            for job in chunk {
                if let Err(err) = ctx.outbox.mark_success(job.id).await {
                    error!(target: "lattice::fanout", job_id = job.id, %err, "mark_success failed");
                }
            }
            ctx.health
                .succeeded
                .fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
            if target == FanoutTarget::Archival {
                ctx.health.reset_archival_streak();
            }
        }
        Err(err) => classify_failure(ctx, target, chunk, err).await,
    }
}

async fn classify_failure(
    ctx: &FanoutContext,
    target: FanoutTarget,
    chunk: &[OutboxJob],
    err: SinkError,
) {
    match target {
        FanoutTarget::Archival => match err.kind {
            SinkErrorKind::Permanent => {
                disable_archival_and_drain(ctx, chunk, &err.message).await;
            }
            SinkErrorKind::ServerShape => {
                if ctx.config.archival_disable_on_transient
                    && ctx
                        .health
                        .record_archival_transient(ctx.config.archival_transient_threshold)
                {
                    disable_archival_and_drain(ctx, chunk, &err.message).await;
                } else {
                    retry_chunk(ctx, chunk, &err.message).await;
                }
            }
            SinkErrorKind::Transient => {
                // Non-server failures reset the disable streak.
                ctx.health.reset_archival_streak();
                retry_chunk(ctx, chunk, &err.message).await;
            }
        },
        FanoutTarget::Analytic
            if err.kind == SinkErrorKind::Permanent && ctx.config.analytic_fail_open =>
        {
            warn!(
                target: "lattice::fanout",
                error = %err.message,
                rows = chunk.len(),
                "analytic sink permanently degraded; marking rows succeeded (fail-open)"
            );
            for job in chunk {
                let _ = ctx.outbox.mark_success(job.id).await;
            }
            ctx.health
                .succeeded
                .fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }
        _ => match err.kind {
            SinkErrorKind::Permanent => fail_chunk(ctx, chunk, &err.message).await,
            _ => retry_chunk(ctx, chunk, &err.message).await,
        },
    }
}

async fn disable_archival_and_drain(ctx: &FanoutContext, chunk: &[OutboxJob], reason: &str) {
    ctx.health.disable_archival(reason);
    let reason = format!("archival runtime disabled: {reason}");
    fail_chunk(ctx, chunk, &reason).await;

    // Fail the rest of the archival backlog so it cannot pile up behind a
    // dead sink; requeueing after re-enable is an explicit operator action.
    match ctx
        .outbox
        .list_jobs(
            &[JobStatus::Pending, JobStatus::Retrying],
            Some(FanoutTarget::Archival),
            10_000,
        )
        .await
    {
        Ok(backlog) => {
            for job in &backlog {
                let _ = ctx.outbox.mark_failed(job.id, &reason).await;
            }
            if !backlog.is_empty() {
                warn!(
                    target: "lattice::fanout",
                    failed = backlog.len(),
                    "archival backlog drained after disable"
                );
                ctx.health
                    .failed
                    .fetch_add(backlog.len() as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Err(err) => {
            error!(target: "lattice::fanout", %err, "failed to drain archival backlog");
        }
    }
}

async fn retry_chunk(ctx: &FanoutContext, chunk: &[OutboxJob], error: &str) {
    for job in chunk {
        if let Err(err) = ctx.outbox.mark_retry(job, error, &ctx.retry_policy).await {
            error!(target: "lattice::fanout", job_id = job.id, %err, "mark_retry failed");
        }
    }
    ctx.health
        .retried
        .fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
}

async fn fail_chunk(ctx: &FanoutContext, chunk: &[OutboxJob], error: &str) {
    for job in chunk {
        if let Err(err) = ctx.outbox.mark_failed(job.id, error).await {
            error!(target: "lattice::fanout", job_id = job.id, %err, "mark_failed failed");
        }
    }
    ctx.health
        .failed
        .fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
}
