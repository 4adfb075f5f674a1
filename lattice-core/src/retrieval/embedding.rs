//! Query/document embeddings with a bounded cache and a deterministic
//! degraded mode: when the provider times out or errors, a hash-derived unit
//! vector keeps vector search available (with a warning) instead of failing
//! the request.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// Present when the deterministic fallback produced this vector.
    pub fallback_reason: Option<String>,
}

#[derive(Debug)]
struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, vector: Vec<f32>) {
        if self.entries.insert(key.clone(), vector).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[derive(Debug)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    url: Option<String>,
    model: String,
    timeout: Duration,
    dim: usize,
    cache: Mutex<EmbeddingCache>,
}

impl EmbeddingClient {
    pub fn new(
        url: Option<String>,
        model: String,
        timeout_secs: f64,
        dim: usize,
        cache_capacity: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            model,
            timeout: Duration::from_secs_f64(timeout_secs.max(0.1)),
            dim: dim.max(8),
            cache: Mutex::new(EmbeddingCache::new(cache_capacity)),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn cache_key(&self, text: &str) -> String {
        let provider = self.url.as_deref().unwrap_or("fallback");
        let mut hasher = Sha1::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"|");
        hasher.update(self.model.as_bytes());
        hasher.update(b"|");
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn embed(&self, text: &str) -> Embedding {
        let key = self.cache_key(text);
        if let Some(vector) = self.cache.lock().expect("embedding cache poisoned").get(&key) {
            return Embedding {
                vector,
                fallback_reason: None,
            };
        }

        match self.fetch_remote(text).await {
            Ok(vector) => {
                self.cache
                    .lock()
                    .expect("embedding cache poisoned")
                    .put(key, vector.clone());
                Embedding {
                    vector,
                    fallback_reason: None,
                }
            }
            Err(reason) => Embedding {
                vector: deterministic_embedding(text, self.dim),
                fallback_reason: Some(reason),
            },
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Embedding> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await);
        }
        out
    }

    async fn fetch_remote(&self, text: &str) -> Result<Vec<f32>, String> {
        let Some(url) = &self.url else {
            return Err("embedding provider not configured".to_string());
        };
        let endpoint = format!("{}/v1/embeddings", url.trim_end_matches('/'));
        let request = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({"model": self.model, "input": [text]}))
            .send();
        let response = request.await.map_err(|err| {
            if err.is_timeout() {
                "embedding request timed out".to_string()
            } else {
                format!("embedding request failed: {err}")
            }
        })?;
        if !response.status().is_success() {
            return Err(format!("embedding provider status {}", response.status()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| format!("embedding response unreadable: {err}"))?;
        let vector = body["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| value.as_f64())
                    .map(|value| value as f32)
                    .collect::<Vec<f32>>()
            })
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| "embedding response missing vector".to_string())?;
        Ok(vector)
    }
}

/// Cheap content-addressed embedding: expand a sha-256 of the text into
/// `dim` floats and normalize. Identical text always embeds identically.
pub fn deterministic_embedding(text: &str, dim: usize) -> Vec<f32> {
    let seed = Sha256::digest(text.as_bytes());
    let mut state = u64::from_le_bytes(seed[..8].try_into().expect("seed slice"));
    let mut vector = Vec::with_capacity(dim);
    for _ in 0..dim {
        // xorshift64 keeps this dependency-free and stable across platforms
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let unit = (state >> 11) as f32 / (1u64 << 53) as f32;
        vector.push(unit * 2.0 - 1.0);
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_embedding_is_deterministic_and_normalized() {
        let a = deterministic_embedding("hello", 64);
        let b = deterministic_embedding("hello", 64);
        let c = deterministic_embedding("world", 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn unconfigured_provider_degrades_with_reason() {
        let client = EmbeddingClient::new(None, "test-model".to_string(), 1.0, 32, 16);
        let embedding = client.embed("query text").await;
        assert_eq!(embedding.vector.len(), 32);
        assert!(embedding.fallback_reason.is_some());
    }
}
