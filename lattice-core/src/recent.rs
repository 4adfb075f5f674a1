//! Bounded ring of recently accepted writes, optionally mirrored to an
//! append-only NDJSON history file.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::event::MemoryEvent;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct RecentEntry {
    pub event_id: String,
    pub project: String,
    pub file: String,
    pub topic_path: String,
    pub summary: String,
    pub deduped: bool,
    pub ts: String,
}

#[derive(Debug)]
pub struct RecentRing {
    capacity: usize,
    history_path: Option<PathBuf>,
    inner: Mutex<VecDeque<RecentEntry>>,
}

impl RecentRing {
    pub fn new(capacity: usize, history_path: Option<PathBuf>) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Self {
            capacity,
            history_path,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn push(&self, event: &MemoryEvent, deduped: bool) {
        let entry = RecentEntry {
            event_id: event.event_id.clone(),
            project: event.project.clone(),
            file: event.file.clone(),
            topic_path: event.topic_path.clone(),
            summary: event.summary.clone(),
            deduped,
            ts: crate::event::now_iso(),
        };
        {
            let mut ring = self.inner.lock().await;
            ring.push_front(entry.clone());
            ring.truncate(self.capacity);
        }
        if let Some(path) = &self.history_path
            && let Err(err) = append_ndjson(path, &entry).await
        {
            tracing::warn!(target: "lattice::recent", %err, "history append failed");
        }
    }

    pub async fn list(&self, limit: usize, project: Option<&str>) -> Vec<RecentEntry> {
        let ring = self.inner.lock().await;
        ring.iter()
            .filter(|entry| project.is_none_or(|scope| entry.project == scope))
            .take(limit)
            .cloned()
            .collect()
    }
}

async fn append_ndjson(path: &PathBuf, entry: &RecentEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(project: &str, file: &str) -> MemoryEvent {
        MemoryEvent::build(project, file, "content".to_string(), None, None, 500).unwrap()
    }

    #[tokio::test]
    async fn ring_is_bounded_and_newest_first() {
        let ring = RecentRing::new(2, None);
        ring.push(&event("alpha", "a.md"), false).await;
        ring.push(&event("alpha", "b.md"), false).await;
        ring.push(&event("beta", "c.md"), false).await;

        let all = ring.list(10, None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].file, "c.md");

        let alpha_only = ring.list(10, Some("alpha")).await;
        assert_eq!(alpha_only.len(), 1);
        assert_eq!(alpha_only[0].file, "b.md");
    }

    #[tokio::test]
    async fn history_mirror_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.ndjson");
        let ring = RecentRing::new(8, Some(path.clone()));
        ring.push(&event("alpha", "a.md"), false).await;
        ring.push(&event("alpha", "b.md"), true).await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["deduped"], true);
        assert!(parsed["ts"].as_str().unwrap().ends_with('Z'));
    }
}
