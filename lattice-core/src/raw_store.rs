//! Raw-event document store client. Every accepted write lands here
//! (best-effort synchronously, with the outbox as backstop); retrieval and
//! retention read it back.

use futures::TryStreamExt;
use mongodb::bson::{Document, doc};
use mongodb::{Client, Collection};

use crate::error::Result;
use crate::event::{MemoryEvent, timestamp_iso};

#[derive(Debug, Clone)]
pub struct RawEventDoc {
    pub event_id: String,
    pub project: String,
    pub file: String,
    pub summary: String,
    pub topic_path: String,
    pub source_kind: String,
    pub updated_at: String,
}

pub struct RawStore {
    events: Collection<Document>,
}

impl std::fmt::Debug for RawStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStore")
            .field("collection", &self.events.name())
            .finish()
    }
}

impl RawStore {
    pub async fn connect(uri: &str, db_name: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! {"ping": 1}).await?;
        let events = db.collection::<Document>(collection);
        events
            .create_index(
                mongodb::IndexModel::builder()
                    .keys(doc! {"event_id": 1})
                    .options(mongodb::options::IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        events
            .create_index(
                mongodb::IndexModel::builder()
                    .keys(doc! {"project": 1, "topic_path": 1, "updated_at": -1})
                    .build(),
            )
            .await?;
        Ok(Self { events })
    }

    /// Idempotent upsert keyed by event id.
    pub async fn persist_event(&self, event: &MemoryEvent) -> Result<()> {
        let now_iso = timestamp_iso(event.updated_at);
        self.events
            .update_one(
                doc! {"event_id": &event.event_id},
                doc! {
                    "$set": {
                        "project": &event.project,
                        "file": &event.file,
                        "summary": &event.summary,
                        "content": &event.content_raw,
                        "content_hash": &event.content_hash,
                        "content_length": event.content_length as i64,
                        "topic_path": &event.topic_path,
                        "topic_tags": event.topic_tags.clone(),
                        "source_kind": &event.source_kind,
                        "request_id": event.request_id.clone().unwrap_or_default(),
                        "updated_at": &now_iso,
                    },
                    "$setOnInsert": {
                        "created_at": timestamp_iso(event.created_at),
                    },
                },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Newest-first scan bounded by `cap`, optionally filtered by project
    /// and topic prefix. Scoring happens in the retrieval layer.
    pub async fn scan_recent(
        &self,
        project: Option<&str>,
        topic_prefix: Option<&str>,
        cap: u32,
    ) -> Result<Vec<RawEventDoc>> {
        let mut filter = doc! {};
        if let Some(project) = project {
            filter.insert("project", project);
        }
        if let Some(prefix) = topic_prefix {
            filter.insert(
                "topic_path",
                doc! {"$regex": format!("^{}", regex::escape(prefix))},
            );
        }
        let mut cursor = self
            .events
            .find(filter)
            .sort(doc! {"updated_at": -1})
            .limit(cap as i64)
            .await?;
        let mut out = Vec::new();
        while let Some(entry) = cursor.try_next().await? {
            out.push(doc_to_event(&entry));
        }
        Ok(out)
    }

    /// Oldest-first scan for the retention sweeper.
    pub async fn scan_oldest(&self, cap: u32) -> Result<Vec<RawEventDoc>> {
        let mut cursor = self
            .events
            .find(doc! {})
            .sort(doc! {"updated_at": 1})
            .limit(cap as i64)
            .await?;
        let mut out = Vec::new();
        while let Some(entry) = cursor.try_next().await? {
            out.push(doc_to_event(&entry));
        }
        Ok(out)
    }

    pub async fn delete_by_event_ids(&self, event_ids: &[String]) -> Result<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .events
            .delete_many(doc! {"event_id": {"$in": event_ids.to_vec()}})
            .await?;
        Ok(result.deleted_count)
    }
}

fn doc_to_event(entry: &Document) -> RawEventDoc {
    RawEventDoc {
        event_id: entry.get_str("event_id").unwrap_or_default().to_string(),
        project: entry.get_str("project").unwrap_or_default().to_string(),
        file: entry.get_str("file").unwrap_or_default().to_string(),
        summary: entry.get_str("summary").unwrap_or_default().to_string(),
        topic_path: entry.get_str("topic_path").unwrap_or_default().to_string(),
        source_kind: entry.get_str("source_kind").unwrap_or_default().to_string(),
        updated_at: entry.get_str("updated_at").unwrap_or_default().to_string(),
    }
}
