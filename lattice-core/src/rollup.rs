//! Hot-file rollups: high-frequency "latest snapshot" writes are buffered in
//! memory and collapsed into one synthesized memory write per interval per
//! `project:file`, so sinks see O(1) traffic instead of O(N).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One buffered hot file awaiting its next flush.
#[derive(Debug, Clone)]
pub struct RollupEntry {
    pub project: String,
    pub file: String,
    pub topic_path: String,
    pub topic_tags: Vec<String>,
    pub events_since_flush: u64,
    pub bytes_since_flush: u64,
    pub first_hash: String,
    pub last_hash: String,
    pub last_summary: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    last_flush: Option<Instant>,
}

/// Input captured from an accepted hot-file write.
#[derive(Debug, Clone)]
pub struct RollupInput {
    pub project: String,
    pub file: String,
    pub summary: String,
    pub topic_path: String,
    pub topic_tags: Vec<String>,
    pub content_hash: String,
    pub content_length: usize,
}

/// A synthesized rollup write ready for the canonical store.
#[derive(Debug, Clone)]
pub struct RollupEmission {
    pub project: String,
    pub file: String,
    pub content: String,
    pub topic_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollupHealth {
    pub pending_keys: usize,
    pub total_buffered: u64,
    pub total_flushed: u64,
    pub last_flush_at: Option<String>,
    pub last_flush_count: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RollupSnapshot<'a> {
    kind: &'static str,
    project: &'a str,
    source_file: &'a str,
    topic_path: &'a str,
    events: u64,
    bytes: u64,
    first_hash: &'a str,
    last_hash: &'a str,
    first_seen_at: String,
    last_seen_at: String,
    last_summary: &'a str,
}

/// Derive the rollup file path: `parent/_rollups/<stem>__rollup.json`.
pub fn rollup_file_for(source_file: &str) -> String {
    let (parent, name) = match source_file.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, source_file),
    };
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    match parent {
        Some(parent) => format!("{parent}/_rollups/{stem}__rollup.json"),
        None => format!("_rollups/{stem}__rollup.json"),
    }
}

#[derive(Debug)]
pub struct RollupBuffer {
    flush_secs: f64,
    inner: Mutex<HashMap<String, RollupEntry>>,
    health: Mutex<RollupHealth>,
}

impl RollupBuffer {
    pub fn new(flush_secs: f64) -> Self {
        Self {
            flush_secs,
            inner: Mutex::new(HashMap::new()),
            health: Mutex::new(RollupHealth::default()),
        }
    }

    pub fn enqueue(&self, input: RollupInput) {
        let key = format!("{}:{}", input.project, input.file);
        let now = Utc::now();
        let mut entries = self.inner.lock().expect("rollup lock poisoned");
        let entry = entries.entry(key).or_insert_with(|| RollupEntry {
            project: input.project.clone(),
            file: input.file.clone(),
            topic_path: input.topic_path.clone(),
            topic_tags: input.topic_tags.clone(),
            events_since_flush: 0,
            bytes_since_flush: 0,
            first_hash: input.content_hash.clone(),
            last_hash: String::new(),
            last_summary: String::new(),
            first_seen: now,
            last_seen: now,
            last_flush: None,
        });
        entry.events_since_flush += 1;
        entry.bytes_since_flush += input.content_length as u64;
        entry.last_hash = input.content_hash;
        entry.last_summary = input.summary;
        entry.topic_path = input.topic_path;
        entry.topic_tags = input.topic_tags;
        entry.last_seen = now;
        drop(entries);

        let mut health = self.health.lock().expect("rollup health lock poisoned");
        health.total_buffered += 1;
        health.pending_keys = self.pending_keys();
    }

    fn pending_keys(&self) -> usize {
        self.inner
            .lock()
            .expect("rollup lock poisoned")
            .values()
            .filter(|entry| entry.events_since_flush > 0)
            .count()
    }

    /// Collect due entries and reset their counters. Entries flush when the
    /// interval elapsed since their last flush, or unconditionally when
    /// `force` is set (shutdown path).
    pub fn drain_due(&self, force: bool) -> Vec<RollupEmission> {
        let now = Instant::now();
        let mut emissions = Vec::new();
        let mut entries = self.inner.lock().expect("rollup lock poisoned");
        for entry in entries.values_mut() {
            if entry.events_since_flush == 0 {
                continue;
            }
            let due = force
                || entry
                    .last_flush
                    .is_none_or(|at| now.duration_since(at).as_secs_f64() >= self.flush_secs);
            if !due {
                continue;
            }
            let snapshot = RollupSnapshot {
                kind: "high_frequency_rollup",
                project: &entry.project,
                source_file: &entry.file,
                topic_path: &entry.topic_path,
                events: entry.events_since_flush,
                bytes: entry.bytes_since_flush,
                first_hash: &entry.first_hash,
                last_hash: &entry.last_hash,
                first_seen_at: crate::event::timestamp_iso(entry.first_seen),
                last_seen_at: crate::event::timestamp_iso(entry.last_seen),
                last_summary: &entry.last_summary,
            };
            let content = serde_json::to_string_pretty(&snapshot)
                .unwrap_or_else(|_| "{}".to_string());
            emissions.push(RollupEmission {
                project: entry.project.clone(),
                file: rollup_file_for(&entry.file),
                content,
                topic_path: entry.topic_path.clone(),
            });
            entry.events_since_flush = 0;
            entry.bytes_since_flush = 0;
            entry.first_hash = entry.last_hash.clone();
            entry.last_flush = Some(now);
        }
        drop(entries);

        let mut health = self.health.lock().expect("rollup health lock poisoned");
        health.pending_keys = self.pending_keys();
        if !emissions.is_empty() {
            health.total_flushed += emissions.len() as u64;
            health.last_flush_count = emissions.len();
            health.last_flush_at = Some(crate::event::now_iso());
        }
        emissions
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut health = self.health.lock().expect("rollup health lock poisoned");
        health.last_error = Some(message.into());
    }

    pub fn health(&self) -> RollupHealth {
        self.health.lock().expect("rollup health lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(project: &str, file: &str, hash: &str, len: usize) -> RollupInput {
        RollupInput {
            project: project.to_string(),
            file: file.to_string(),
            summary: format!("summary for {hash}"),
            topic_path: "telemetry".to_string(),
            topic_tags: vec!["telemetry".to_string()],
            content_hash: hash.to_string(),
            content_length: len,
        }
    }

    #[test]
    fn rollup_path_preserves_directory() {
        assert_eq!(
            rollup_file_for("telemetry/queue__latest.json"),
            "telemetry/_rollups/queue__latest__rollup.json"
        );
        assert_eq!(
            rollup_file_for("queue__latest.json"),
            "_rollups/queue__latest__rollup.json"
        );
    }

    #[test]
    fn forced_flush_emits_compact_snapshot() {
        let buffer = RollupBuffer::new(3600.0);
        buffer.enqueue(input("alpha", "telemetry/queue__latest.json", "abc123", 5120));
        buffer.enqueue(input("alpha", "telemetry/queue__latest.json", "def456", 4096));

        let emissions = buffer.drain_due(true);
        assert_eq!(emissions.len(), 1);
        let emission = &emissions[0];
        assert_eq!(emission.file, "telemetry/_rollups/queue__latest__rollup.json");
        assert!(emission.content.contains("\"kind\": \"high_frequency_rollup\""));
        assert!(emission
            .content
            .contains("\"source_file\": \"telemetry/queue__latest.json\""));
        assert!(emission.content.contains("\"events\": 2"));

        // Nothing left pending afterwards.
        assert!(buffer.drain_due(true).is_empty());
        assert_eq!(buffer.health().total_flushed, 1);
    }

    #[test]
    fn interval_gates_unforced_flush() {
        let buffer = RollupBuffer::new(3600.0);
        buffer.enqueue(input("alpha", "a__latest.json", "h", 10));
        // First flush: no prior flush timestamp, so the entry is due.
        assert_eq!(buffer.drain_due(false).len(), 1);
        buffer.enqueue(input("alpha", "a__latest.json", "h2", 10));
        // Second flush within the interval is withheld unless forced.
        assert!(buffer.drain_due(false).is_empty());
        assert_eq!(buffer.drain_due(true).len(), 1);
    }
}
