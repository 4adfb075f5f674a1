//! Asynchronous distribution of accepted memory events to their sinks.
//!
//! Ingest enqueues durable outbox rows and pushes a wake signal; a pool of
//! workers claims batches, applies backpressure and per-target rate limits,
//! and dispatches bulk writes to the sink clients.

pub mod ratelimit;
pub mod sinks;
pub mod worker;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

pub use ratelimit::TargetRateLimiters;
pub use worker::{FanoutContext, WorkerClass, spawn_workers};

/// Bounded wake-up channel between ingest and the fanout workers. When the
/// channel is full the signal is dropped (and counted); the durable outbox
/// row is unaffected, the next poll tick picks it up.
#[derive(Debug)]
pub struct FanoutSignal {
    tx: mpsc::Sender<()>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl FanoutSignal {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn notify(&self) {
        if self.tx.try_send(()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait up to `timeout` for a wake signal. Workers share one receiver;
    /// a signal wakes exactly one of them, the rest time out and poll.
    pub async fn wait(&self, timeout: std::time::Duration) -> bool {
        let mut rx = match tokio::time::timeout(timeout, self.rx.lock()).await {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(timeout, rx.recv()).await,
            Ok(Some(()))
        )
    }

    /// Fraction of the channel currently occupied, `0.0..=1.0`.
    pub fn depth_ratio(&self) -> f64 {
        let free = self.tx.capacity();
        let used = self.capacity.saturating_sub(free);
        used as f64 / self.capacity as f64
    }

    pub fn dropped_signals(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Backpressure delay for one dispatch chunk: zero at or below the
/// watermark, scaling linearly to `max_sleep_secs` at a full queue.
pub fn backpressure_sleep_secs(ratio: f64, watermark: f64, max_sleep_secs: f64) -> f64 {
    if ratio <= watermark || watermark >= 1.0 {
        return 0.0;
    }
    let pressure = ((ratio - watermark) / (1.0 - watermark)).min(1.0);
    pressure * max_sleep_secs
}

/// Process-wide fanout runtime state surfaced by `/telemetry/fanout`.
#[derive(Debug, Default)]
pub struct FanoutHealth {
    archival_disabled: AtomicBool,
    archival_disabled_reason: Mutex<Option<String>>,
    archival_transient_streak: AtomicU32,
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub backpressure_sleeps: AtomicU64,
    pub coalesced_total: AtomicU64,
    pub admission_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutHealthSnapshot {
    pub archival_disabled: bool,
    pub archival_disabled_reason: Option<String>,
    pub archival_transient_streak: u32,
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub backpressure_sleeps: u64,
    pub coalesced_total: u64,
    pub admission_dropped: u64,
}

impl FanoutHealth {
    pub fn is_archival_disabled(&self) -> bool {
        self.archival_disabled.load(Ordering::Relaxed)
    }

    pub fn disable_archival(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(target: "lattice::fanout", %reason, "archival runtime disabled");
        self.archival_disabled.store(true, Ordering::Relaxed);
        let mut guard = self
            .archival_disabled_reason
            .lock()
            .expect("archival reason lock poisoned");
        *guard = Some(reason);
    }

    /// Count a 5xx-shaped archival failure. Returns true when the streak
    /// reached the disable threshold.
    pub fn record_archival_transient(&self, threshold: u32) -> bool {
        let streak = self
            .archival_transient_streak
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        streak >= threshold
    }

    /// Any non-5xx archival outcome (success or other failure) resets the
    /// streak.
    pub fn reset_archival_streak(&self) {
        self.archival_transient_streak.store(0, Ordering::Relaxed);
    }

    pub fn archival_streak(&self) -> u32 {
        self.archival_transient_streak.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FanoutHealthSnapshot {
        FanoutHealthSnapshot {
            archival_disabled: self.is_archival_disabled(),
            archival_disabled_reason: self
                .archival_disabled_reason
                .lock()
                .expect("archival reason lock poisoned")
                .clone(),
            archival_transient_streak: self.archival_streak(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            backpressure_sleeps: self.backpressure_sleeps.load(Ordering::Relaxed),
            coalesced_total: self.coalesced_total.load(Ordering::Relaxed),
            admission_dropped: self.admission_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_curve_matches_contract() {
        // At the watermark the delay is zero.
        assert_eq!(backpressure_sleep_secs(0.65, 0.65, 2.0), 0.0);
        // At a full queue the delay is max_sleep.
        let full = backpressure_sleep_secs(1.0, 0.65, 2.0);
        assert!((full - 2.0).abs() < 1e-9);
        // Halfway between watermark and full is half the max sleep.
        let mid = backpressure_sleep_secs(0.825, 0.65, 2.0);
        assert!((mid - 1.0).abs() < 1e-6);
        assert_eq!(backpressure_sleep_secs(0.2, 0.65, 2.0), 0.0);
    }

    #[test]
    fn archival_streak_threshold() {
        let health = FanoutHealth::default();
        assert!(!health.record_archival_transient(3));
        assert!(!health.record_archival_transient(3));
        assert!(health.record_archival_transient(3));
        health.reset_archival_streak();
        assert_eq!(health.archival_streak(), 0);
    }

    #[tokio::test]
    async fn signal_counts_drops_and_reports_depth() {
        let signal = FanoutSignal::new(2);
        signal.notify();
        signal.notify();
        signal.notify();
        assert_eq!(signal.dropped_signals(), 1);
        assert!((signal.depth_ratio() - 1.0).abs() < 1e-9);
        assert!(signal.wait(std::time::Duration::from_millis(10)).await);
        assert!((signal.depth_ratio() - 0.5).abs() < 1e-9);
    }
}
