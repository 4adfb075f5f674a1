//! Feedback store and the preference context that feeds retrieval's
//! learning rerank.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use crate::error::{LatticeError, Result};
use crate::event::now_iso;
use crate::retrieval::{PreferenceTerms, tokenize};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    project TEXT,
    user_id TEXT,
    source TEXT NOT NULL DEFAULT 'user',
    task_id TEXT,
    rating INTEGER,
    sentiment TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    content TEXT NOT NULL DEFAULT '',
    topic_path TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_feedback_scope
    ON feedback (project, user_id, created_at);
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackCreate {
    pub project: Option<String>,
    pub user_id: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub task_id: Option<String>,
    pub rating: Option<i64>,
    pub sentiment: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content: String,
    pub topic_path: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_source() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRow {
    pub id: String,
    pub created_at: String,
    pub project: Option<String>,
    pub user_id: Option<String>,
    pub source: String,
    pub task_id: Option<String>,
    pub rating: Option<i64>,
    pub sentiment: Option<String>,
    pub tags: Vec<String>,
    pub content: String,
    pub topic_path: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackFilter {
    pub project: Option<String>,
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub limit: u32,
}

/// Compact natural-language view of a user's feedback history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreferenceContext {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    pub notes: Vec<String>,
    pub total: u64,
    pub updated_at: Option<String>,
    pub rendered: String,
}

impl PreferenceContext {
    pub fn terms(&self) -> PreferenceTerms {
        let mut terms = PreferenceTerms::default();
        for entry in &self.positive {
            terms.positive.extend(tokenize(entry));
        }
        for entry in &self.negative {
            terms.negative.extend(tokenize(entry));
        }
        terms
    }
}

#[derive(Debug)]
pub struct FeedbackStore {
    pool: SqlitePool,
}

impl FeedbackStore {
    pub async fn init(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn create(&self, input: FeedbackCreate) -> Result<FeedbackRow> {
        if let Some(rating) = input.rating
            && !(1..=5).contains(&rating)
        {
            return Err(LatticeError::validation("rating must be between 1 and 5"));
        }
        let id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        let created_at = now_iso();
        let tags_raw = serde_json::to_string(&input.tags)?;
        let metadata_raw = serde_json::to_string(&input.metadata)?;
        sqlx::query(
            "INSERT INTO feedback (\
                 id, created_at, project, user_id, source, task_id, rating, sentiment, \
                 tags, content, topic_path, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&created_at)
        .bind(&input.project)
        .bind(&input.user_id)
        .bind(&input.source)
        .bind(&input.task_id)
        .bind(input.rating)
        .bind(&input.sentiment)
        .bind(&tags_raw)
        .bind(&input.content)
        .bind(&input.topic_path)
        .bind(&metadata_raw)
        .execute(&self.pool)
        .await?;
        Ok(FeedbackRow {
            id,
            created_at,
            project: input.project,
            user_id: input.user_id,
            source: input.source,
            task_id: input.task_id,
            rating: input.rating,
            sentiment: input.sentiment,
            tags: input.tags,
            content: input.content,
            topic_path: input.topic_path,
            metadata: input.metadata,
        })
    }

    pub async fn list(&self, filter: &FeedbackFilter) -> Result<Vec<FeedbackRow>> {
        let mut sql = String::from("SELECT * FROM feedback WHERE 1=1");
        if filter.project.is_some() {
            sql.push_str(" AND project = ?");
        }
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.source.is_some() {
            sql.push_str(" AND source = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(project) = &filter.project {
            query = query.bind(project);
        }
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id);
        }
        if let Some(source) = &filter.source {
            query = query.bind(source);
        }
        let limit = if filter.limit == 0 { 100 } else { filter.limit.min(500) };
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let tags_raw: String = row.try_get("tags")?;
                let metadata_raw: String = row.try_get("metadata")?;
                Ok(FeedbackRow {
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                    project: row.try_get("project")?,
                    user_id: row.try_get("user_id")?,
                    source: row.try_get("source")?,
                    task_id: row.try_get("task_id")?,
                    rating: row.try_get("rating")?,
                    sentiment: row.try_get("sentiment")?,
                    tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
                    content: row.try_get("content")?,
                    topic_path: row.try_get("topic_path")?,
                    metadata: serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    /// Bucketize recent feedback into positive/negative/notes and render a
    /// compact context string for agents.
    pub async fn build_preference_context(
        &self,
        project: Option<&str>,
        user_id: Option<&str>,
        limit: u32,
    ) -> Result<PreferenceContext> {
        let rows = self
            .list(&FeedbackFilter {
                project: project.map(str::to_string),
                user_id: user_id.map(str::to_string),
                source: None,
                limit,
            })
            .await?;
        let mut context = PreferenceContext {
            total: rows.len() as u64,
            updated_at: rows.first().map(|row| row.created_at.clone()),
            ..PreferenceContext::default()
        };
        for row in rows {
            if row.content.trim().is_empty() {
                continue;
            }
            let sentiment = row.sentiment.as_deref().unwrap_or("");
            if row.rating.is_some_and(|rating| rating >= 4) || sentiment == "positive" {
                context.positive.push(row.content);
            } else if row.rating.is_some_and(|rating| rating <= 2) || sentiment == "negative" {
                context.negative.push(row.content);
            } else {
                context.notes.push(row.content);
            }
        }
        context.rendered = render_context(&context);
        Ok(context)
    }
}

fn render_context(context: &PreferenceContext) -> String {
    let mut parts = Vec::new();
    if !context.positive.is_empty() {
        parts.push(format!("Prefers: {}", clip_join(&context.positive)));
    }
    if !context.negative.is_empty() {
        parts.push(format!("Avoid: {}", clip_join(&context.negative)));
    }
    if !context.notes.is_empty() {
        parts.push(format!("Notes: {}", clip_join(&context.notes)));
    }
    parts.join(" ")
}

fn clip_join(entries: &[String]) -> String {
    entries
        .iter()
        .take(5)
        .map(|entry| {
            let mut cut = entry.len().min(120);
            while !entry.is_char_boundary(cut) {
                cut -= 1;
            }
            entry[..cut].trim().to_string()
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> FeedbackStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        FeedbackStore::init(pool).await.unwrap()
    }

    fn entry(rating: Option<i64>, sentiment: Option<&str>, content: &str) -> FeedbackCreate {
        FeedbackCreate {
            project: Some("alpha".into()),
            user_id: Some("u1".into()),
            source: "user".into(),
            task_id: None,
            rating,
            sentiment: sentiment.map(str::to_string),
            tags: vec![],
            content: content.into(),
            topic_path: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn context_buckets_by_rating_and_sentiment() {
        let store = store().await;
        store
            .create(entry(Some(5), None, "prefer structured output"))
            .await
            .unwrap();
        store
            .create(entry(Some(1), None, "avoid verbose dumps"))
            .await
            .unwrap();
        store
            .create(entry(None, Some("positive"), "retrieval summaries help"))
            .await
            .unwrap();
        store.create(entry(None, None, "neutral remark")).await.unwrap();

        let context = store
            .build_preference_context(Some("alpha"), Some("u1"), 50)
            .await
            .unwrap();
        assert_eq!(context.total, 4);
        assert_eq!(context.positive.len(), 2);
        assert_eq!(context.negative.len(), 1);
        assert_eq!(context.notes.len(), 1);
        assert!(context.rendered.contains("Prefers:"));
        assert!(context.rendered.contains("Avoid:"));

        let terms = context.terms();
        assert!(terms.positive.contains("structured"));
        assert!(terms.negative.contains("verbose"));
    }

    #[tokio::test]
    async fn rating_bounds_are_validated() {
        let store = store().await;
        let err = store.create(entry(Some(9), None, "x")).await.unwrap_err();
        assert!(matches!(err, LatticeError::Validation(_)));
    }

    #[tokio::test]
    async fn list_filters_by_source() {
        let store = store().await;
        store.create(entry(Some(4), None, "from user")).await.unwrap();
        let mut agent_entry = entry(None, None, "from agent");
        agent_entry.source = "agent".into();
        store.create(agent_entry).await.unwrap();

        let agents = store
            .list(&FeedbackFilter {
                source: Some("agent".into()),
                limit: 10,
                ..FeedbackFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].content, "from agent");
    }
}
