//! Per-project topic tree: recursive write counts persisted as a single
//! JSON document, updated atomically after every accepted memory write.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicNode {
    pub count: u64,
    #[serde(default)]
    pub children: BTreeMap<String, TopicNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicEntry {
    pub project: String,
    pub path: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicListResult {
    pub topics: Vec<TopicEntry>,
    pub total: usize,
}

/// The whole tree lives behind one async mutex; updates mutate and persist
/// while holding it so the on-disk document never interleaves writers.
#[derive(Debug)]
pub struct TopicTree {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, TopicNode>>,
}

impl TopicTree {
    pub async fn load(path: PathBuf) -> Self {
        let tree = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(target: "lattice::topics", %err, "topic tree unreadable; starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            inner: Mutex::new(tree),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Increment counts along the topic path and persist the document.
    pub async fn record(&self, project: &str, topic_path: &str) -> Result<()> {
        let mut tree = self.inner.lock().await;
        let node = tree.entry(project.to_string()).or_default();
        node.count += 1;
        let mut cursor = node;
        for segment in topic_path.split('/').filter(|segment| !segment.is_empty()) {
            cursor = cursor.children.entry(segment.to_string()).or_default();
            cursor.count += 1;
        }
        self.persist(&tree).await
    }

    async fn persist(&self, tree: &BTreeMap<String, TopicNode>) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rendered = serde_json::to_vec_pretty(tree)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &rendered).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Depth-pruned view for `/memory/topics`.
    pub async fn snapshot(&self, project: Option<&str>, depth: usize) -> serde_json::Value {
        let tree = self.inner.lock().await;
        match project {
            Some(name) => tree
                .get(name)
                .map(|node| prune(node, depth))
                .unwrap_or_else(|| serde_json::json!({"count": 0, "children": {}})),
            None => {
                let mut out = serde_json::Map::new();
                for (name, node) in tree.iter() {
                    out.insert(name.clone(), prune(node, depth));
                }
                serde_json::Value::Object(out)
            }
        }
    }

    /// Flat listing for `topics/list`: every node whose path starts with
    /// `prefix`, with at least `min_count` writes, at most `depth` segments
    /// deep, ordered by count descending then project/path.
    pub async fn list(
        &self,
        project: Option<&str>,
        prefix: Option<&str>,
        limit: usize,
        min_count: u64,
        depth: usize,
    ) -> TopicListResult {
        let tree = self.inner.lock().await;
        let mut matches = Vec::new();
        for (name, node) in tree.iter() {
            if project.is_some_and(|scope| scope != name) {
                continue;
            }
            collect_matches(name, node, String::new(), prefix, min_count, depth, &mut matches);
        }
        matches.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.project.cmp(&b.project))
                .then_with(|| a.path.cmp(&b.path))
        });
        let total = matches.len();
        matches.truncate(limit);
        TopicListResult {
            topics: matches,
            total,
        }
    }
}

fn prune(node: &TopicNode, depth: usize) -> serde_json::Value {
    let children: serde_json::Map<String, serde_json::Value> = if depth == 0 {
        serde_json::Map::new()
    } else {
        node.children
            .iter()
            .map(|(name, child)| (name.clone(), prune(child, depth - 1)))
            .collect()
    };
    serde_json::json!({"count": node.count, "children": children})
}

fn collect_matches(
    project: &str,
    node: &TopicNode,
    path: String,
    prefix: Option<&str>,
    min_count: u64,
    depth: usize,
    out: &mut Vec<TopicEntry>,
) {
    for (segment, child) in node.children.iter() {
        let child_path = if path.is_empty() {
            segment.clone()
        } else {
            format!("{path}/{segment}")
        };
        let segments = child_path.split('/').count();
        // A node is *reportable* when it sits at or below the prefix; we
        // still descend through ancestors of the prefix to reach it.
        let matched = match prefix {
            Some(prefix) => {
                child_path == prefix
                    || child_path.starts_with(&format!("{prefix}/"))
                    || prefix.starts_with(&format!("{child_path}/"))
            }
            None => true,
        };
        let reportable = match prefix {
            Some(prefix) => {
                child_path == prefix || child_path.starts_with(&format!("{prefix}/"))
            }
            None => true,
        };
        if reportable && child.count >= min_count && segments <= depth {
            out.push(TopicEntry {
                project: project.to_string(),
                path: child_path.clone(),
                count: child.count,
            });
        }
        if matched && segments < depth {
            collect_matches(project, child, child_path, prefix, min_count, depth, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> TopicTree {
        let tree = TopicTree::in_memory();
        for _ in 0..4 {
            tree.record("alpha", "channels/telegram").await.unwrap();
        }
        for _ in 0..2 {
            tree.record("alpha", "channels/slack").await.unwrap();
        }
        for _ in 0..3 {
            tree.record("beta", "channels/telegram").await.unwrap();
        }
        tree
    }

    #[tokio::test]
    async fn list_filters_by_prefix_across_projects() {
        let tree = seeded().await;
        let result = tree
            .list(None, Some("channels/telegram"), 10, 3, 8)
            .await;
        assert_eq!(result.total, 2);
        let projects: Vec<&str> = result.topics.iter().map(|t| t.project.as_str()).collect();
        assert_eq!(projects, vec!["alpha", "beta"]);
        assert!(result.topics.iter().all(|t| t.path == "channels/telegram"));
        let counts: Vec<u64> = result.topics.iter().map(|t| t.count).collect();
        assert_eq!(counts, vec![4, 3]);
    }

    #[tokio::test]
    async fn list_scopes_to_project_and_min_count() {
        let tree = TopicTree::in_memory();
        for _ in 0..2 {
            tree.record("alpha", "root/docs").await.unwrap();
        }
        for _ in 0..3 {
            tree.record("alpha", "root/code").await.unwrap();
        }
        let result = tree.list(Some("alpha"), Some("root"), 10, 2, 6).await;
        assert_eq!(result.total, 3);
        assert_eq!(result.topics[0].path, "root");
        assert_eq!(result.topics[0].count, 5);
    }

    #[tokio::test]
    async fn snapshot_prunes_depth() {
        let tree = seeded().await;
        let snapshot = tree.snapshot(Some("alpha"), 1).await;
        assert_eq!(snapshot["count"], 6);
        assert!(snapshot["children"]["channels"]["children"]
            .as_object()
            .unwrap()
            .is_empty());
    }
}
