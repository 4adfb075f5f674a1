//! Archival conversational store sink. Passages are inserted one per event
//! with bounded concurrency inside a batch; error classification feeds the
//! runtime-disable logic in the worker.

use async_trait::async_trait;
use futures::StreamExt;

use crate::outbox::{FanoutTarget, OutboxJob};

use super::{FanoutSink, SinkError, SinkErrorKind};

const BATCH_CONCURRENCY: usize = 4;

#[derive(Debug)]
pub struct ArchivalSink {
    http: reqwest::Client,
    url: String,
    timeout: std::time::Duration,
}

impl ArchivalSink {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            timeout: std::time::Duration::from_secs(20),
        }
    }

    /// Header+summary text format the retrieval side parses back.
    fn render_passage(job: &OutboxJob) -> String {
        let metadata = serde_json::json!({
            "event_id": job.event_id,
            "kind": "memory_write",
        });
        format!(
            "project={} file={} topic={}\nsummary: {}\nmetadata: {}",
            job.project, job.file, job.topic_path, job.summary, metadata
        )
    }

    async fn insert_one(&self, job: &OutboxJob) -> Result<(), SinkError> {
        let endpoint = format!("{}/v1/passages", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "text": Self::render_passage(job),
            "tags": [
                format!("project:{}", job.project),
                format!("topic:{}", job.topic_path),
            ],
        });
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                SinkError::transient(format!("archival insert failed: {err}"))
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("not found") || lowered.contains("invalid argument") {
            return Err(SinkError::permanent(format!(
                "status={} body={}",
                status.as_u16(),
                super::truncate(&text, 300)
            )));
        }
        Err(SinkError::from_status(status, &text))
    }
}

#[async_trait]
impl FanoutSink for ArchivalSink {
    fn target(&self) -> FanoutTarget {
        FanoutTarget::Archival
    }

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError> {
        let failures: Vec<SinkError> = futures::stream::iter(0..jobs.len())
            .map(|idx| self.insert_one(&jobs[idx]))
            .buffer_unordered(BATCH_CONCURRENCY)
            .filter_map(|outcome| async move { outcome.err() })
            .collect()
            .await;
        if failures.is_empty() {
            return Ok(());
        }
        // Report the most severe classification for the chunk.
        let severity = |kind: SinkErrorKind| match kind {
            SinkErrorKind::Permanent => 2,
            SinkErrorKind::ServerShape => 1,
            SinkErrorKind::Transient => 0,
        };
        Err(failures
            .into_iter()
            .max_by_key(|failure| severity(failure.kind))
            .expect("non-empty failures"))
    }
}
