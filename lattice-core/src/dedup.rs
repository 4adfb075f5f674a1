//! In-memory write suppression: a sliding-window dedup map for identical
//! payloads and a bounded latest-hash map for hot "latest snapshot" files.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// Sliding-window duplicate suppression keyed by `project:file:hash`.
///
/// Entries older than the window are pruned opportunistically; when the map
/// still exceeds its cap, the oldest-inserted keys are evicted first.
#[derive(Debug)]
pub struct DedupWindow {
    window_secs: f64,
    max_keys: usize,
    anchor: Instant,
    inner: Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    seen: HashMap<String, f64>,
    insertion: VecDeque<String>,
}

impl DedupWindow {
    pub fn new(window_secs: f64, max_keys: usize) -> Self {
        Self {
            window_secs,
            max_keys: max_keys.max(1),
            anchor: Instant::now(),
            inner: Mutex::new(DedupState::default()),
        }
    }

    pub fn key(project: &str, file: &str, content_hash: &str) -> String {
        format!("{project}:{file}:{content_hash}")
    }

    pub fn should_skip(&self, key: &str) -> bool {
        self.should_skip_at(key, self.anchor.elapsed().as_secs_f64())
    }

    /// Clock-injected variant used by tests and the ingest pipeline.
    pub fn should_skip_at(&self, key: &str, now_secs: f64) -> bool {
        if self.window_secs <= 0.0 {
            return false;
        }
        let mut state = self.inner.lock().expect("dedup lock poisoned");
        if let Some(&seen_at) = state.seen.get(key)
            && now_secs - seen_at < self.window_secs
        {
            return true;
        }
        if state.seen.insert(key.to_string(), now_secs).is_none() {
            state.insertion.push_back(key.to_string());
        }

        // Age-based pruning first, then LRU-by-insertion when over the cap.
        let cutoff = now_secs - self.window_secs;
        while let Some(front) = state.insertion.front() {
            let expired = state.seen.get(front).is_none_or(|&at| at <= cutoff);
            if expired {
                let front = state.insertion.pop_front().expect("front checked");
                state.seen.remove(&front);
            } else {
                break;
            }
        }
        while state.seen.len() > self.max_keys {
            let Some(front) = state.insertion.pop_front() else {
                break;
            };
            state.seen.remove(&front);
        }
        false
    }
}

/// Bounded map of the most recent content hash per `project:file`, used to
/// short-circuit hot-file writes whose payload did not change.
#[derive(Debug)]
pub struct LatestHashMap {
    max_keys: usize,
    inner: Mutex<LatestHashState>,
}

#[derive(Debug, Default)]
struct LatestHashState {
    hashes: HashMap<String, String>,
    insertion: VecDeque<String>,
}

impl LatestHashMap {
    pub fn new(max_keys: usize) -> Self {
        Self {
            max_keys: max_keys.max(1),
            inner: Mutex::new(LatestHashState::default()),
        }
    }

    /// Returns true when the stored hash for this key already equals
    /// `content_hash`. Otherwise records the new hash and returns false.
    pub fn is_unchanged(&self, project: &str, file: &str, content_hash: &str) -> bool {
        let key = format!("{project}:{file}");
        let mut state = self.inner.lock().expect("latest-hash lock poisoned");
        if state.hashes.get(&key).is_some_and(|hash| hash == content_hash) {
            return true;
        }
        if state.hashes.insert(key.clone(), content_hash.to_string()).is_none() {
            state.insertion.push_back(key);
        }
        while state.hashes.len() > self.max_keys {
            let Some(front) = state.insertion.pop_front() else {
                break;
            };
            state.hashes.remove(&front);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_suppresses_then_expires() {
        let window = DedupWindow::new(120.0, 1000);
        let key = DedupWindow::key("alpha", "notes/a.md", "h1");
        assert!(!window.should_skip_at(&key, 100.0));
        assert!(window.should_skip_at(&key, 150.0));
        assert!(!window.should_skip_at(&key, 400.0));
    }

    #[test]
    fn cap_evicts_oldest_insertions() {
        let window = DedupWindow::new(1000.0, 2);
        assert!(!window.should_skip_at("a", 1.0));
        assert!(!window.should_skip_at("b", 2.0));
        assert!(!window.should_skip_at("c", 3.0));
        // "a" was evicted by the cap, so it is no longer suppressed.
        assert!(!window.should_skip_at("a", 4.0));
        // "c" is still inside the window.
        assert!(window.should_skip_at("c", 5.0));
    }

    #[test]
    fn latest_hash_tracks_changes() {
        let latest = LatestHashMap::new(10);
        assert!(!latest.is_unchanged("alpha", "metrics__latest.json", "aaa"));
        assert!(latest.is_unchanged("alpha", "metrics__latest.json", "aaa"));
        assert!(!latest.is_unchanged("alpha", "metrics__latest.json", "bbb"));
    }
}
