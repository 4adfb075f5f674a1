//! Vector store sink: embeds summaries and bulk-upserts points over the
//! store's REST API.

use std::sync::Arc;

use async_trait::async_trait;

use crate::outbox::{FanoutTarget, OutboxJob};
use crate::retrieval::embedding::EmbeddingClient;

use super::{FanoutSink, SinkError};

#[derive(Debug)]
pub struct VectorSink {
    http: reqwest::Client,
    url: String,
    collection: String,
    embeddings: Arc<EmbeddingClient>,
    timeout: std::time::Duration,
}

impl VectorSink {
    pub fn new(url: String, collection: String, embeddings: Arc<EmbeddingClient>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            collection,
            embeddings,
            timeout: std::time::Duration::from_secs(15),
        }
    }

    /// Stable numeric point id from the event identity.
    fn point_id(event_id: &str) -> u64 {
        u64::from_str_radix(event_id.get(..16).unwrap_or("0"), 16).unwrap_or(0)
    }
}

#[async_trait]
impl FanoutSink for VectorSink {
    fn target(&self) -> FanoutTarget {
        FanoutTarget::Vector
    }

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError> {
        let texts: Vec<String> = jobs.iter().map(|job| job.summary.clone()).collect();
        let embeddings = self.embeddings.embed_batch(&texts).await;

        let points: Vec<serde_json::Value> = jobs
            .iter()
            .zip(embeddings.iter())
            .map(|(job, embedding)| {
                serde_json::json!({
                    "id": Self::point_id(&job.event_id),
                    "vector": embedding.vector,
                    "payload": {
                        "event_id": job.event_id,
                        "project": job.project,
                        "file": job.file,
                        "summary": job.summary,
                        "topic_path": job.topic_path,
                        "topic_tags": job.topic_tags,
                    },
                })
            })
            .collect();

        let endpoint = format!(
            "{}/collections/{}/points?wait=true",
            self.url.trim_end_matches('/'),
            self.collection
        );
        let response = self
            .http
            .put(&endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({"points": points}))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SinkError::transient(format!("vector upsert timed out: {err}"))
                } else {
                    SinkError::transient(format!("vector upsert failed: {err}"))
                }
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::from_status(status, &body))
    }
}
