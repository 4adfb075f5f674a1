//! Memory event construction: path normalization, topic derivation,
//! summarization, and content-derived identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LatticeError, Result};

/// An accepted memory write, immutable after creation. This is the payload
/// snapshot carried by outbox rows and persisted to the raw-event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub event_id: String,
    pub project: String,
    pub file: String,
    pub content_raw: String,
    pub summary: String,
    pub topic_path: String,
    pub topic_tags: Vec<String>,
    pub content_hash: String,
    pub content_length: usize,
    /// `memory_write` for direct ingest, `high_frequency_rollup` for
    /// synthesized rollup snapshots.
    pub source_kind: String,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn build(
        project: &str,
        file: &str,
        content: String,
        topic_override: Option<&str>,
        request_id: Option<String>,
        summary_max_chars: usize,
    ) -> Result<Self> {
        let project = normalize_project(project)?;
        let file = normalize_file_path(file)?;
        let topic_path = derive_topic_path(&file, topic_override);
        let topic_tags = topic_tags(&topic_path);
        let summary = summarize(&content, summary_max_chars);
        let content_hash = content_hash(&content);
        let event_id = event_id(&project, &file, &content);
        let now = Utc::now();
        Ok(Self {
            event_id,
            project,
            file,
            content_length: content.len(),
            content_raw: content,
            summary,
            topic_path,
            topic_tags,
            content_hash,
            source_kind: "memory_write".to_string(),
            request_id,
            created_at: now,
            updated_at: now,
        })
    }
}

pub fn normalize_project(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LatticeError::validation("projectName must not be empty"));
    }
    if trimmed.contains('/') || trimmed.contains("..") {
        return Err(LatticeError::validation(format!(
            "projectName '{trimmed}' must be a single path segment"
        )));
    }
    Ok(trimmed.to_string())
}

/// Normalize a slash-separated file path: collapse duplicate separators,
/// strip a leading slash, and reject traversal segments.
pub fn normalize_file_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().replace('\\', "/");
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.is_empty() {
        return Err(LatticeError::validation("fileName must not be empty"));
    }
    if segments.iter().any(|segment| *segment == "..") {
        return Err(LatticeError::validation(format!(
            "fileName '{raw}' must not contain '..'"
        )));
    }
    Ok(segments.join("/"))
}

/// Topic path comes from the explicit override when present, otherwise from
/// the file's parent directories. Files at the project root land in `root`.
pub fn derive_topic_path(file: &str, explicit: Option<&str>) -> String {
    if let Some(path) = explicit {
        let cleaned: Vec<&str> = path
            .trim()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if !cleaned.is_empty() {
            return cleaned.join("/");
        }
    }
    match file.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => "root".to_string(),
    }
}

/// Progressive prefixes of the topic path: `a/b/c` tags `a`, `a/b`, `a/b/c`.
pub fn topic_tags(topic_path: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut prefix = String::new();
    for segment in topic_path.split('/').filter(|segment| !segment.is_empty()) {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        tags.push(prefix.clone());
    }
    if tags.is_empty() {
        tags.push("root".to_string());
    }
    tags
}

/// Bounded summary preserving head and tail when the content is over limit.
pub fn summarize(content: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(8);
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }
    let head_len = max_chars * 3 / 5;
    let tail_len = max_chars / 4;
    let head: String = content.chars().take(head_len).collect();
    let tail: String = content
        .chars()
        .skip(total.saturating_sub(tail_len))
        .collect();
    format!("{head} … {tail}")
}

pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)
}

/// Stable 32-hex event identity derived from the write coordinates and
/// content. Re-ingesting identical content yields the same id.
pub fn event_id(project: &str, file: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(b"|");
    hasher.update(file.as_bytes());
    hasher.update(b"|");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// RFC 3339 with a trailing `Z`, the timestamp form used across stores.
pub fn timestamp_iso(moment: DateTime<Utc>) -> String {
    moment.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn now_iso() -> String {
    timestamp_iso(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_rejects_traversal() {
        assert_eq!(
            normalize_file_path("notes//a.md").unwrap(),
            "notes/a.md".to_string()
        );
        assert_eq!(
            normalize_file_path("/notes/./a.md").unwrap(),
            "notes/a.md".to_string()
        );
        assert!(normalize_file_path("notes/../secrets.md").is_err());
        assert!(normalize_file_path("  ").is_err());
    }

    #[test]
    fn topic_path_defaults_to_root_for_top_level_files() {
        assert_eq!(derive_topic_path("a.md", None), "root");
        assert_eq!(derive_topic_path("notes/deep/a.md", None), "notes/deep");
        assert_eq!(derive_topic_path("notes/a.md", Some("agents/protocols")), "agents/protocols");
    }

    #[test]
    fn topic_tags_are_progressive_prefixes() {
        assert_eq!(
            topic_tags("agents/protocols/v2"),
            vec!["agents", "agents/protocols", "agents/protocols/v2"]
        );
        assert_eq!(topic_tags(""), vec!["root"]);
    }

    #[test]
    fn summary_preserves_head_and_tail() {
        let content = "x".repeat(300) + &"y".repeat(300);
        let summary = summarize(&content, 100);
        assert!(summary.chars().count() < 110);
        assert!(summary.starts_with('x'));
        assert!(summary.ends_with('y'));

        let short = "short note";
        assert_eq!(summarize(short, 100), short);
    }

    #[test]
    fn event_id_is_stable_and_content_derived() {
        let a = event_id("alpha", "notes/a.md", "hello");
        let b = event_id("alpha", "notes/a.md", "hello");
        let c = event_id("alpha", "notes/a.md", "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
