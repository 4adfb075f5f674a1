//! SQL analytic sink: bulk INSERT over the analytic store's HTTP query
//! endpoint. File-corruption responses are permanent by definition; the
//! worker decides whether they fail open.

use async_trait::async_trait;

use crate::event::timestamp_iso;
use crate::outbox::{FanoutTarget, OutboxJob};

use super::{FanoutSink, SinkError, SinkErrorKind};

const CORRUPTION_MARKERS: [&str; 3] = [
    "database disk image is malformed",
    "file is not a database",
    "database or disk is full",
];

#[derive(Debug)]
pub struct AnalyticSink {
    http: reqwest::Client,
    url: String,
    db: String,
    table: String,
    timeout: std::time::Duration,
}

impl AnalyticSink {
    pub fn new(url: String, db: String, table: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            db,
            table,
            timeout: std::time::Duration::from_secs(20),
        }
    }

    fn escape(raw: &str) -> String {
        raw.replace('\'', "''")
    }

    fn bulk_insert_sql(&self, jobs: &[OutboxJob]) -> String {
        let values: Vec<String> = jobs
            .iter()
            .map(|job| {
                format!(
                    "('{}', '{}', '{}', '{}', '{}', '{}')",
                    Self::escape(&job.event_id),
                    Self::escape(&job.project),
                    Self::escape(&job.file),
                    Self::escape(&job.summary),
                    Self::escape(&job.topic_path),
                    timestamp_iso(job.updated_at),
                )
            })
            .collect();
        format!(
            "INSERT INTO {}.{} (event_id, project, file, summary, topic_path, updated_at) VALUES {}",
            self.db,
            self.table,
            values.join(", ")
        )
    }
}

#[async_trait]
impl FanoutSink for AnalyticSink {
    fn target(&self) -> FanoutTarget {
        FanoutTarget::Analytic
    }

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError> {
        let sql = self.bulk_insert_sql(jobs);
        let endpoint = format!("{}/api/sql/query", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({"query": sql}))
            .send()
            .await
            .map_err(|err| SinkError::transient(format!("analytic insert failed: {err}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let lowered = body.to_ascii_lowercase();
        if CORRUPTION_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            return Err(SinkError {
                kind: SinkErrorKind::Permanent,
                message: format!("analytic store corruption: {}", super::truncate(&body, 300)),
            });
        }
        if status.is_success() {
            // The query endpoint reports SQL errors inside a 200 body.
            if lowered.contains("\"type\": \"error\"") || lowered.contains("\"error\":") {
                return Err(SinkError::transient(format!(
                    "analytic query error: {}",
                    super::truncate(&body, 300)
                )));
            }
            return Ok(());
        }
        Err(SinkError::from_status(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(summary: &str) -> OutboxJob {
        OutboxJob {
            id: 1,
            event_id: "e".repeat(32),
            target: FanoutTarget::Analytic,
            project: "alpha".into(),
            file: "notes/a.md".into(),
            summary: summary.into(),
            payload: serde_json::Value::Null,
            topic_path: "notes".into(),
            topic_tags: vec!["notes".into()],
            status: crate::outbox::JobStatus::Running,
            attempts: 1,
            max_attempts: 10,
            next_attempt_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            dedupe_key: "k".into(),
        }
    }

    #[test]
    fn bulk_sql_escapes_quotes() {
        let sink = AnalyticSink::new(
            "http://localhost".into(),
            "lattice".into(),
            "memory_events".into(),
        );
        let sql = sink.bulk_insert_sql(&[job("it's a note")]);
        assert!(sql.contains("it''s a note"));
        assert!(sql.starts_with("INSERT INTO lattice.memory_events"));
    }
}
