//! The five retrieval source implementations behind one trait seam, so the
//! engine (and its tests) never care which backend a row came from.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::canonical::CanonicalClient;
use crate::error::{LatticeError, Result};
use crate::raw_store::RawStore;

use super::embedding::EmbeddingClient;
use super::{SourceId, lexical_score};

#[derive(Debug, Clone)]
pub struct SourceQuery {
    pub query: String,
    pub project: Option<String>,
    pub topic_path: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub project: String,
    pub file: String,
    pub summary: String,
    pub score: f64,
}

#[async_trait]
pub trait RetrievalSource: Send + Sync {
    fn id(&self) -> SourceId;

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>>;
}

// ---------------------------------------------------------------------------
// vector

pub struct VectorSource {
    http: reqwest::Client,
    url: String,
    collection: String,
    embeddings: Arc<EmbeddingClient>,
}

impl VectorSource {
    pub fn new(url: String, collection: String, embeddings: Arc<EmbeddingClient>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            collection,
            embeddings,
        }
    }
}

#[async_trait]
impl RetrievalSource for VectorSource {
    fn id(&self) -> SourceId {
        SourceId::Vector
    }

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let embedding = self.embeddings.embed(&query.query).await;

        let mut must = Vec::new();
        if let Some(project) = &query.project {
            must.push(json!({"key": "project", "match": {"value": project}}));
        }
        if let Some(topic) = &query.topic_path {
            must.push(json!({"key": "topic_tags", "match": {"value": topic}}));
        }
        let mut body = json!({
            "vector": embedding.vector,
            "limit": query.limit,
            "with_payload": true,
        });
        if !must.is_empty() {
            body["filter"] = json!({"must": must});
        }

        let endpoint = format!(
            "{}/collections/{}/points/search",
            self.url.trim_end_matches('/'),
            self.collection
        );
        let response = self.http.post(&endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(LatticeError::upstream(format!(
                "vector search status {}",
                response.status()
            )));
        }
        let parsed: serde_json::Value = response.json().await?;
        let rows = parsed["result"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| SourceRow {
                        project: hit["payload"]["project"].as_str().unwrap_or("").to_string(),
                        file: hit["payload"]["file"].as_str().unwrap_or("").to_string(),
                        summary: hit["payload"]["summary"].as_str().unwrap_or("").to_string(),
                        score: hit["score"].as_f64().unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// raw

pub struct RawSource {
    store: Arc<RawStore>,
    scan_cap: u32,
}

impl RawSource {
    pub fn new(store: Arc<RawStore>, scan_cap: u32) -> Self {
        Self { store, scan_cap }
    }
}

#[async_trait]
impl RetrievalSource for RawSource {
    fn id(&self) -> SourceId {
        SourceId::Raw
    }

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let docs = self
            .store
            .scan_recent(
                query.project.as_deref(),
                query.topic_path.as_deref(),
                self.scan_cap,
            )
            .await?;
        let mut rows: Vec<SourceRow> = docs
            .into_iter()
            .filter_map(|doc| {
                let haystack = format!("{} {}", doc.file, doc.summary);
                let score = lexical_score(&query.query, &haystack);
                (score > 0.0).then_some(SourceRow {
                    project: doc.project,
                    file: doc.file,
                    summary: doc.summary,
                    score,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        rows.truncate(query.limit);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// analytic

pub struct AnalyticSource {
    http: reqwest::Client,
    url: String,
    db: String,
    table: String,
}

impl AnalyticSource {
    pub fn new(url: String, db: String, table: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            db,
            table,
        }
    }

    fn escape_like(raw: &str) -> String {
        raw.replace('\'', "''").replace('%', "").replace('_', " ")
    }
}

/// Rows from the analytic store's table-shaped response
/// (`{column_names, data}`), zipped into objects.
pub fn table_rows(raw: &serde_json::Value) -> Vec<serde_json::Map<String, serde_json::Value>> {
    let Some(columns) = raw["column_names"].as_array() else {
        return Vec::new();
    };
    let names: Vec<String> = columns
        .iter()
        .filter_map(|name| name.as_str())
        .map(str::to_string)
        .collect();
    raw["data"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.as_array())
                .map(|values| {
                    names
                        .iter()
                        .cloned()
                        .zip(values.iter().cloned())
                        .collect::<serde_json::Map<String, serde_json::Value>>()
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl RetrievalSource for AnalyticSource {
    fn id(&self) -> SourceId {
        SourceId::Analytic
    }

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let needle = Self::escape_like(query.query.trim());
        let mut clauses = vec![format!(
            "(summary LIKE '%{needle}%' OR file LIKE '%{needle}%')"
        )];
        if let Some(project) = &query.project {
            clauses.push(format!("project = '{}'", project.replace('\'', "''")));
        }
        if let Some(topic) = &query.topic_path {
            clauses.push(format!(
                "topic_path LIKE '{}%'",
                topic.replace('\'', "''")
            ));
        }
        let sql = format!(
            "SELECT project, file, summary FROM {}.{} WHERE {} LIMIT {}",
            self.db,
            self.table,
            clauses.join(" AND "),
            query.limit.max(1)
        );

        let endpoint = format!("{}/api/sql/query", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({"query": sql}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LatticeError::upstream(format!(
                "analytic search status {}",
                response.status()
            )));
        }
        let parsed: serde_json::Value = response.json().await?;
        let rows = table_rows(&parsed)
            .into_iter()
            .map(|row| {
                let summary = row
                    .get("summary")
                    .and_then(|value| value.as_str())
                    .unwrap_or("")
                    .to_string();
                let file = row
                    .get("file")
                    .and_then(|value| value.as_str())
                    .unwrap_or("")
                    .to_string();
                let score = lexical_score(&query.query, &format!("{file} {summary}"));
                SourceRow {
                    project: row
                        .get("project")
                        .and_then(|value| value.as_str())
                        .unwrap_or("")
                        .to_string(),
                    file,
                    summary,
                    score,
                }
            })
            .filter(|row| row.score > 0.0)
            .collect();
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// archival

pub struct ArchivalSource {
    http: reqwest::Client,
    url: String,
}

impl ArchivalSource {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

/// Parse the `project=... file=... topic=...` header format archival
/// passages carry, plus the summary line.
pub fn parse_passage_content(text: &str) -> std::collections::HashMap<String, String> {
    let mut parsed = std::collections::HashMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(summary) = trimmed.strip_prefix("summary:") {
            parsed.insert("summary".to_string(), summary.trim().to_string());
            continue;
        }
        if trimmed.starts_with("metadata:") {
            continue;
        }
        for token in trimmed.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                let key = match key {
                    "topic" => "topic_path",
                    other => other,
                };
                parsed.insert(key.to_string(), value.to_string());
            }
        }
    }
    parsed
}

#[async_trait]
impl RetrievalSource for ArchivalSource {
    fn id(&self) -> SourceId {
        SourceId::Archival
    }

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let mut tags = Vec::new();
        if let Some(project) = &query.project {
            tags.push(format!("project:{project}"));
        }
        let endpoint = format!("{}/v1/passages/search", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({
                "query": query.query,
                "tags": tags,
                "limit": query.limit,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LatticeError::upstream(format!(
                "archival search status {}",
                response.status()
            )));
        }
        let parsed: serde_json::Value = response.json().await?;
        let passages = parsed["passages"]
            .as_array()
            .or_else(|| parsed.as_array())
            .cloned()
            .unwrap_or_default();
        let rows = passages
            .iter()
            .filter_map(|passage| passage["text"].as_str())
            .map(|text| {
                let fields = parse_passage_content(text);
                let summary = fields.get("summary").cloned().unwrap_or_default();
                let score = lexical_score(&query.query, text);
                SourceRow {
                    project: fields.get("project").cloned().unwrap_or_default(),
                    file: fields.get("file").cloned().unwrap_or_default(),
                    summary,
                    score,
                }
            })
            .filter(|row| row.score > 0.0)
            .collect();
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// canonical-lexical

pub struct CanonicalLexicalSource {
    canonical: Arc<CanonicalClient>,
    project_file_cap: usize,
    total_file_cap: usize,
}

impl CanonicalLexicalSource {
    pub fn new(
        canonical: Arc<CanonicalClient>,
        project_file_cap: usize,
        total_file_cap: usize,
    ) -> Self {
        Self {
            canonical,
            project_file_cap,
            total_file_cap,
        }
    }
}

#[async_trait]
impl RetrievalSource for CanonicalLexicalSource {
    fn id(&self) -> SourceId {
        SourceId::CanonicalLexical
    }

    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let projects = match &query.project {
            Some(project) => vec![project.clone()],
            None => self.canonical.list_projects().await?,
        };

        let mut rows = Vec::new();
        let mut walked = 0usize;
        for project in projects {
            let files = self.canonical.list_files(&project).await?;
            for file in files.into_iter().take(self.project_file_cap) {
                if walked >= self.total_file_cap {
                    break;
                }
                walked += 1;
                if let Some(topic) = &query.topic_path
                    && !file.starts_with(topic.as_str())
                {
                    continue;
                }
                let score = lexical_score(&query.query, &file);
                if score > 0.0 {
                    rows.push(SourceRow {
                        project: project.clone(),
                        file: file.clone(),
                        summary: file,
                        score,
                    });
                }
            }
        }
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        rows.truncate(query.limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passage_header_round_trips() {
        let payload = "project=alpha file=decisions/one.md topic=agents/protocols\n\
                       summary: Key decision made for retrieval path\n\
                       metadata: {\"kind\":\"decision\"}";
        let parsed = parse_passage_content(payload);
        assert_eq!(parsed["project"], "alpha");
        assert_eq!(parsed["file"], "decisions/one.md");
        assert_eq!(parsed["topic_path"], "agents/protocols");
        assert!(parsed["summary"].contains("retrieval path"));
    }

    #[test]
    fn table_rows_zip_columns() {
        let raw = json!({
            "type": "table",
            "column_names": ["project", "file", "summary"],
            "data": [["alpha", "notes/a.txt", "hello"]],
        });
        let rows = table_rows(&raw);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["project"], "alpha");
        assert_eq!(rows[0]["file"], "notes/a.txt");
        assert_eq!(rows[0]["summary"], "hello");
    }
}
