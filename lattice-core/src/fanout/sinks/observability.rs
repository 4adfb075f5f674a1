//! Observability sink: batched ingestion events describing each accepted
//! memory write.

use async_trait::async_trait;

use crate::event::timestamp_iso;
use crate::outbox::{FanoutTarget, OutboxJob};

use super::{FanoutSink, SinkError};

#[derive(Debug)]
pub struct ObservabilitySink {
    http: reqwest::Client,
    url: String,
    timeout: std::time::Duration,
}

impl ObservabilitySink {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            timeout: std::time::Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl FanoutSink for ObservabilitySink {
    fn target(&self) -> FanoutTarget {
        FanoutTarget::Observability
    }

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError> {
        let batch: Vec<serde_json::Value> = jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "id": format!("{}:observability", job.event_id),
                    "type": "trace-create",
                    "timestamp": timestamp_iso(job.updated_at),
                    "body": {
                        "name": "memory_write",
                        "metadata": {
                            "event_id": job.event_id,
                            "project": job.project,
                            "file": job.file,
                            "topic_path": job.topic_path,
                        },
                        "input": job.summary,
                    },
                })
            })
            .collect();

        let endpoint = format!("{}/api/public/ingestion", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({"batch": batch}))
            .send()
            .await
            .map_err(|err| SinkError::transient(format!("observability send failed: {err}")))?;
        let status = response.status();
        // 207 means per-item results; duplicates are fine for replays.
        if status.is_success() || status.as_u16() == 207 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::from_status(status, &body))
    }
}
