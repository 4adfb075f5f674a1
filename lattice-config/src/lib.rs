//! Shared configuration library for Lattice.
//!
//! This crate centralizes environment loading and validation for the
//! orchestrator. Every knob is a named environment variable with a documented
//! default; `LatticeConfig::load()` never fails on malformed values (it falls
//! back to defaults and records a warning), while
//! [`LatticeConfig::validate_security_posture`] enforces the hard rules that
//! must hold before the server binds a socket.

pub mod util;
pub mod validation;

use std::path::PathBuf;

use serde::Serialize;

use crate::util::{
    env_bool, env_csv, env_f64, env_kv_f64, env_string, env_u32, env_u64, env_usize,
};
pub use crate::validation::{ConfigWarning, ConfigWarnings, SecurityPostureError};

/// Runtime environment the service believes it is deployed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Development,
    Production,
}

impl RuntimeEnv {
    fn from_env() -> Self {
        match env_string("LATTICE_ENV").as_deref() {
            Some("production") | Some("prod") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Which durable backend owns the fanout outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxBackendKind {
    Sqlite,
    Mongo,
}

impl OutboxBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mongo => "mongo",
        }
    }
}

/// What the ingest path does when content matches a secret pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretMode {
    Allow,
    Redact,
    Block,
}

/// Whether canonical-store writes are awaited inline or queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalWriteMode {
    Sync,
    Async,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub env: RuntimeEnv,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    /// Path prefixes that bypass the shared-secret check. `/health` is
    /// always public regardless of this list.
    pub public_prefixes: Vec<String>,
    pub public_status: bool,
    pub public_docs: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Sqlite file holding the outbox, tasks, task events, and feedback.
    pub task_db_path: PathBuf,
    pub outbox_backend: OutboxBackendKind,
    pub mongo_uri: Option<String>,
    pub mongo_db: String,
    pub raw_collection: String,
    pub outbox_collection: String,
    pub canonical_url: Option<String>,
    pub analytic_url: Option<String>,
    pub analytic_db: String,
    pub analytic_table: String,
    pub archival_url: Option<String>,
    pub observability_url: Option<String>,
    pub vector_url: Option<String>,
    pub vector_collection: String,
    /// Permit the one-way sqlite -> mongo promotion on disk I/O errors.
    pub allow_promotion: bool,
    /// Permit falling back to sqlite when the mongo backend fails to init.
    pub allow_demotion: bool,
    /// Topic tree JSON document location.
    pub topic_tree_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub url: Option<String>,
    pub model: String,
    pub timeout_secs: f64,
    pub dim: usize,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub workers: usize,
    pub archival_workers: usize,
    pub batch_size: u32,
    pub bulk_size_vector: usize,
    pub bulk_size_analytic: usize,
    /// Per-target sustained rate limits in requests per second.
    pub rate_limits: Vec<(String, f64)>,
    pub max_attempts: u32,
    pub retry_base_secs: f64,
    pub retry_cap_secs: f64,
    pub coalesce_window_secs: f64,
    pub coalesce_targets: Vec<String>,
    pub backpressure_watermark: f64,
    pub backpressure_targets: Vec<String>,
    pub backpressure_max_sleep_secs: f64,
    pub signal_capacity: usize,
    pub poll_interval_secs: f64,
    pub analytic_fail_open: bool,
    pub archival_disable_on_transient: bool,
    pub archival_transient_threshold: u32,
    pub summary_cache_ttl_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionConfig {
    pub gc_interval_secs: u64,
    pub succeeded_hours: u32,
    pub failed_hours: u32,
    pub stale_pending_hours: u32,
    pub stale_targets: Vec<String>,
    pub gc_vacuum: bool,
    pub gc_vacuum_min_deleted: u64,
    pub gc_min_vacuum_interval_secs: u64,
    /// Rows stuck in `running` longer than this are recovered to `retrying`.
    pub stale_running_secs: u64,
    pub sink_interval_secs: u64,
    pub sink_timeout_secs: u64,
    pub sink_scan_cap: u32,
    pub sink_delete_cap: u32,
    pub low_value_suffixes: Vec<String>,
    pub low_value_prefixes: Vec<String>,
    pub min_summary_chars: usize,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub sources: Vec<String>,
    pub fast_sources: Vec<String>,
    pub slow_sources: Vec<String>,
    pub staged_fetch: bool,
    pub min_results_for_skip: usize,
    pub min_top_score: f64,
    pub source_timeout_secs: f64,
    pub learning_enabled: bool,
    pub learning_boost: f64,
    pub learning_penalty: f64,
    /// Raw-store scan cap per retrieval request.
    pub scan_cap: u32,
    /// Canonical-lexical walk caps.
    pub project_file_cap: usize,
    pub total_file_cap: usize,
    pub source_weights: Vec<(String, f64)>,
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub lease_secs: u64,
    pub default_max_attempts: u32,
    pub workers: usize,
    pub poll_interval_secs: f64,
    pub callback_hosts: Vec<String>,
    pub allowed_actions: Vec<String>,
    pub retry_base_secs: f64,
    pub retry_cap_secs: f64,
}

#[derive(Debug, Clone)]
pub struct SecretsConfig {
    pub storage_mode: SecretMode,
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub strict_channels: Vec<String>,
    pub prefix: String,
    pub default_project: String,
    pub topic_root: String,
}

#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub enabled: bool,
    pub hot_suffixes: Vec<String>,
    pub flush_secs: f64,
    pub dedup_window_secs: f64,
    pub dedup_max_keys: usize,
    pub latest_hash_max_keys: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub min_summary_chars: usize,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub canonical_write_mode: CanonicalWriteMode,
    pub canonical_queue_capacity: usize,
    pub summary_max_chars: usize,
    pub recent_capacity: usize,
    pub recent_history_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ChatProviderConfig {
    pub url: Option<String>,
    pub model: String,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone)]
pub struct LatticeConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub fanout: FanoutConfig,
    pub retention: RetentionConfig,
    pub retrieval: RetrievalConfig,
    pub tasks: TaskQueueConfig,
    pub secrets: SecretsConfig,
    pub messaging: MessagingConfig,
    pub rollup: RollupConfig,
    pub admission: AdmissionConfig,
    pub ingest: IngestConfig,
    pub chat: ChatProviderConfig,
}

impl LatticeConfig {
    /// Load every section from the process environment, collecting
    /// non-fatal issues into [`ConfigWarnings`].
    pub fn load() -> (Self, ConfigWarnings) {
        let mut warnings = ConfigWarnings::default();

        let server = ServerConfig {
            host: env_string("LATTICE_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env_u32("LATTICE_PORT", 8075) as u16,
            env: RuntimeEnv::from_env(),
        };

        let mut public_prefixes = env_csv("LATTICE_PUBLIC_PREFIXES", &["/health"]);
        if !public_prefixes.iter().any(|prefix| prefix == "/health") {
            public_prefixes.push("/health".to_string());
        }
        let auth = AuthConfig {
            api_key: env_string("LATTICE_API_KEY"),
            public_prefixes,
            public_status: env_bool("LATTICE_PUBLIC_STATUS", false),
            public_docs: env_bool("LATTICE_PUBLIC_DOCS", false),
        };

        let outbox_backend = match env_string("OUTBOX_BACKEND").as_deref() {
            Some("mongo") => OutboxBackendKind::Mongo,
            Some("sqlite") | None => OutboxBackendKind::Sqlite,
            Some(other) => {
                warnings.push(format!(
                    "OUTBOX_BACKEND '{other}' is not recognized; using sqlite"
                ));
                OutboxBackendKind::Sqlite
            }
        };
        let storage = StorageConfig {
            task_db_path: env_string("TASK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/lattice_tasks.db")),
            outbox_backend,
            mongo_uri: env_string("MONGO_URI"),
            mongo_db: env_string("MONGO_DB").unwrap_or_else(|| "lattice".to_string()),
            raw_collection: env_string("MONGO_RAW_COLLECTION")
                .unwrap_or_else(|| "raw_events".to_string()),
            outbox_collection: env_string("MONGO_OUTBOX_COLLECTION")
                .unwrap_or_else(|| "fanout_outbox".to_string()),
            canonical_url: env_string("CANONICAL_STORE_URL"),
            analytic_url: env_string("ANALYTIC_STORE_URL"),
            analytic_db: env_string("ANALYTIC_DB").unwrap_or_else(|| "lattice".to_string()),
            analytic_table: env_string("ANALYTIC_TABLE")
                .unwrap_or_else(|| "memory_events".to_string()),
            archival_url: env_string("ARCHIVAL_STORE_URL"),
            observability_url: env_string("OBSERVABILITY_URL"),
            vector_url: env_string("VECTOR_STORE_URL"),
            vector_collection: env_string("VECTOR_COLLECTION")
                .unwrap_or_else(|| "lattice_notes".to_string()),
            allow_promotion: env_bool("OUTBOX_ALLOW_PROMOTION", true),
            allow_demotion: env_bool("OUTBOX_ALLOW_DEMOTION", true),
            topic_tree_path: env_string("TOPIC_TREE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/topic_tree.json")),
        };
        if storage.outbox_backend == OutboxBackendKind::Mongo && storage.mongo_uri.is_none() {
            warnings.push("OUTBOX_BACKEND=mongo requires MONGO_URI; sqlite will be used instead");
        }

        let embedding = EmbeddingConfig {
            url: env_string("EMBEDDING_URL"),
            model: env_string("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            timeout_secs: env_f64("EMBEDDING_TIMEOUT_SECS", 3.0),
            dim: env_usize("EMBEDDING_DIM", 384),
            cache_capacity: env_usize("EMBEDDING_CACHE_CAPACITY", 512),
        };

        let mut backpressure_watermark = env_f64("FANOUT_BACKPRESSURE_WATERMARK", 0.65);
        if !(0.0..1.0).contains(&backpressure_watermark) {
            warnings.push(format!(
                "FANOUT_BACKPRESSURE_WATERMARK {backpressure_watermark} outside [0,1); using 0.65"
            ));
            backpressure_watermark = 0.65;
        }
        let fanout = FanoutConfig {
            workers: env_usize("FANOUT_WORKERS", 2).max(1),
            archival_workers: env_usize("ARCHIVAL_WORKERS", 1),
            batch_size: env_u32("FANOUT_BATCH_SIZE", 16).max(1),
            bulk_size_vector: env_usize("FANOUT_BULK_SIZE_VECTOR", 32).max(1),
            bulk_size_analytic: env_usize("FANOUT_BULK_SIZE_ANALYTIC", 64).max(1),
            rate_limits: env_kv_f64(
                "FANOUT_RATE_LIMITS",
                &[("vector", 20.0), ("analytic", 40.0), ("archival", 2.0)],
            ),
            max_attempts: env_u32("FANOUT_MAX_ATTEMPTS", 10).max(1),
            retry_base_secs: env_f64("FANOUT_RETRY_BASE_SECS", 2.0),
            retry_cap_secs: env_f64("FANOUT_RETRY_CAP_SECS", 300.0),
            coalesce_window_secs: env_f64("FANOUT_COALESCE_WINDOW_SECS", 30.0),
            coalesce_targets: env_csv("FANOUT_COALESCE_TARGETS", &["vector", "analytic"]),
            backpressure_watermark,
            backpressure_targets: env_csv("FANOUT_BACKPRESSURE_TARGETS", &["archival"]),
            backpressure_max_sleep_secs: env_f64("FANOUT_BACKPRESSURE_MAX_SLEEP_SECS", 2.0),
            signal_capacity: env_usize("FANOUT_SIGNAL_CAPACITY", 1024).max(1),
            poll_interval_secs: env_f64("FANOUT_POLL_INTERVAL_SECS", 1.0),
            analytic_fail_open: env_bool("ANALYTIC_FAIL_OPEN", true),
            archival_disable_on_transient: env_bool("ARCHIVAL_DISABLE_ON_TRANSIENT", true),
            archival_transient_threshold: env_u32("ARCHIVAL_TRANSIENT_THRESHOLD", 3).max(1),
            summary_cache_ttl_secs: env_f64("FANOUT_SUMMARY_CACHE_TTL_SECS", 5.0),
        };

        let retention = RetentionConfig {
            gc_interval_secs: env_u64("OUTBOX_GC_INTERVAL_SECS", 3600),
            succeeded_hours: env_u32("OUTBOX_SUCCEEDED_RETENTION_HOURS", 24),
            failed_hours: env_u32("OUTBOX_FAILED_RETENTION_HOURS", 168),
            stale_pending_hours: env_u32("OUTBOX_STALE_PENDING_HOURS", 24),
            stale_targets: env_csv("OUTBOX_STALE_TARGETS", &["archival"]),
            gc_vacuum: env_bool("OUTBOX_GC_VACUUM", false),
            gc_vacuum_min_deleted: env_u64("OUTBOX_GC_VACUUM_MIN_DELETED", 500),
            gc_min_vacuum_interval_secs: env_u64("OUTBOX_GC_MIN_VACUUM_INTERVAL_SECS", 86_400),
            stale_running_secs: env_u64("OUTBOX_STALE_RUNNING_SECS", 600),
            sink_interval_secs: env_u64("SINK_RETENTION_INTERVAL_SECS", 21_600),
            sink_timeout_secs: env_u64("SINK_RETENTION_TIMEOUT_SECS", 60),
            sink_scan_cap: env_u32("SINK_RETENTION_SCAN_CAP", 2000),
            sink_delete_cap: env_u32("SINK_RETENTION_DELETE_CAP", 500),
            low_value_suffixes: env_csv("LOW_VALUE_SUFFIXES", &["__latest.json", ".tmp"]),
            low_value_prefixes: env_csv("LOW_VALUE_PREFIXES", &["telemetry", "signals/live"]),
            min_summary_chars: env_usize("ADMISSION_MIN_SUMMARY_CHARS", 80),
        };

        let retrieval = RetrievalConfig {
            sources: env_csv(
                "RETRIEVAL_SOURCES",
                &["vector", "raw", "analytic", "archival", "canonical-lexical"],
            ),
            fast_sources: env_csv("RETRIEVAL_FAST_SOURCES", &["vector", "raw", "analytic"]),
            slow_sources: env_csv(
                "RETRIEVAL_SLOW_SOURCES",
                &["archival", "canonical-lexical"],
            ),
            staged_fetch: env_bool("RETRIEVAL_STAGED_FETCH", true),
            min_results_for_skip: env_usize("RETRIEVAL_MIN_RESULTS_FOR_SKIP", 1),
            min_top_score: env_f64("RETRIEVAL_MIN_TOP_SCORE", 0.8),
            source_timeout_secs: env_f64("RETRIEVAL_SOURCE_TIMEOUT_SECS", 4.0),
            learning_enabled: env_bool("LEARNING_LOOP_ENABLED", true),
            learning_boost: env_f64("RETRIEVAL_LEARNING_BOOST", 0.08),
            learning_penalty: env_f64("RETRIEVAL_LEARNING_PENALTY", 0.12),
            scan_cap: env_u32("RETRIEVAL_SCAN_CAP", 500),
            project_file_cap: env_usize("RETRIEVAL_PROJECT_FILE_CAP", 200),
            total_file_cap: env_usize("RETRIEVAL_TOTAL_FILE_CAP", 1000),
            source_weights: env_kv_f64(
                "RETRIEVAL_SOURCE_WEIGHTS",
                &[
                    ("vector", 1.0),
                    ("raw", 0.85),
                    ("analytic", 0.8),
                    ("archival", 0.75),
                    ("canonical-lexical", 0.7),
                ],
            ),
        };

        let tasks = TaskQueueConfig {
            lease_secs: env_u64("TASK_LEASE_SECS", 60),
            default_max_attempts: env_u32("TASK_MAX_ATTEMPTS", 4).max(1),
            workers: env_usize("TASK_WORKERS", 1),
            poll_interval_secs: env_f64("TASK_POLL_INTERVAL_SECS", 3.0),
            callback_hosts: env_csv("TASK_CALLBACK_HOSTS", &[]),
            allowed_actions: env_csv(
                "TASK_ALLOWED_ACTIONS",
                &[
                    "memory_write",
                    "memory_search",
                    "messaging_command",
                    "http_callback",
                    "provider_chat",
                ],
            ),
            retry_base_secs: env_f64("TASK_RETRY_BASE_SECS", 15.0),
            retry_cap_secs: env_f64("TASK_RETRY_CAP_SECS", 900.0),
        };

        let storage_mode = match env_string("SECRETS_STORAGE_MODE").as_deref() {
            Some("allow") => SecretMode::Allow,
            Some("block") => SecretMode::Block,
            Some("redact") | None => SecretMode::Redact,
            Some(other) => {
                warnings.push(format!(
                    "SECRETS_STORAGE_MODE '{other}' is not recognized; using redact"
                ));
                SecretMode::Redact
            }
        };
        let secrets = SecretsConfig { storage_mode };

        let messaging = MessagingConfig {
            strict_channels: env_csv("MESSAGING_STRICT_CHANNELS", &["openclaw", "zeroclaw"]),
            prefix: env_string("MESSAGING_PREFIX").unwrap_or_else(|| "@lattice".to_string()),
            default_project: env_string("MESSAGING_DEFAULT_PROJECT")
                .unwrap_or_else(|| "messaging".to_string()),
            topic_root: env_string("MESSAGING_TOPIC_ROOT")
                .unwrap_or_else(|| "channels".to_string()),
        };

        let rollup = RollupConfig {
            enabled: env_bool("ROLLUP_ENABLED", true),
            hot_suffixes: env_csv("HOT_FILE_SUFFIXES", &["__latest.json"]),
            flush_secs: env_f64("ROLLUP_FLUSH_SECS", 30.0),
            dedup_window_secs: env_f64("MEMORY_DEDUP_WINDOW_SECS", 120.0),
            dedup_max_keys: env_usize("MEMORY_DEDUP_MAX_KEYS", 4096),
            latest_hash_max_keys: env_usize("MEMORY_LATEST_HASH_MAX_KEYS", 1024),
        };

        let admission = AdmissionConfig {
            enabled: env_bool("ADMISSION_ENABLED", true),
            soft_limit: env_u64("ADMISSION_SOFT_LIMIT", 500),
            hard_limit: env_u64("ADMISSION_HARD_LIMIT", 2000),
            min_summary_chars: env_usize("ADMISSION_MIN_SUMMARY_CHARS", 80),
        };

        let canonical_write_mode = match env_string("CANONICAL_WRITE_MODE").as_deref() {
            Some("sync") => CanonicalWriteMode::Sync,
            _ => CanonicalWriteMode::Async,
        };
        let ingest = IngestConfig {
            canonical_write_mode,
            canonical_queue_capacity: env_usize("CANONICAL_QUEUE_CAPACITY", 256).max(1),
            summary_max_chars: env_usize("MEMORY_SUMMARY_MAX_CHARS", 500),
            recent_capacity: env_usize("RECENT_RING_CAPACITY", 256),
            recent_history_path: env_string("RECENT_HISTORY_PATH").map(PathBuf::from),
        };

        let chat = ChatProviderConfig {
            url: env_string("PROVIDER_CHAT_URL"),
            model: env_string("PROVIDER_CHAT_MODEL")
                .unwrap_or_else(|| "qwen2.5-coder:7b".to_string()),
            timeout_secs: env_f64("PROVIDER_CHAT_TIMEOUT_SECS", 60.0),
        };

        let config = Self {
            server,
            auth,
            storage,
            embedding,
            fanout,
            retention,
            retrieval,
            tasks,
            secrets,
            messaging,
            rollup,
            admission,
            ingest,
            chat,
        };
        config.collect_posture_warnings(&mut warnings);
        (config, warnings)
    }

    fn collect_posture_warnings(&self, warnings: &mut ConfigWarnings) {
        if self.auth.api_key.is_none() && !self.server.env.is_production() {
            warnings.push("LATTICE_API_KEY is unset; all endpoints are unauthenticated");
        }
        if self.auth.public_status {
            warnings.push("status endpoint is public (LATTICE_PUBLIC_STATUS=true)");
        }
        if self.auth.public_docs {
            warnings.push("docs endpoint is public (LATTICE_PUBLIC_DOCS=true)");
        }
        if self.storage.canonical_url.is_none() {
            warnings.push("CANONICAL_STORE_URL is unset; canonical reads/writes are disabled");
        }
    }

    /// Hard startup rules. In production the service refuses to run without
    /// an API key; everything else is a warning surfaced at load time.
    pub fn validate_security_posture(&self) -> Result<(), SecurityPostureError> {
        if self.server.env.is_production()
            && self
                .auth
                .api_key
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(SecurityPostureError::MissingApiKey);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_without_api_key_is_rejected() {
        let (mut config, _) = LatticeConfig::load();
        config.server.env = RuntimeEnv::Production;
        config.auth.api_key = None;
        assert!(matches!(
            config.validate_security_posture(),
            Err(SecurityPostureError::MissingApiKey)
        ));

        config.auth.api_key = Some("secret".to_string());
        assert!(config.validate_security_posture().is_ok());
    }

    #[test]
    fn health_prefix_is_always_public() {
        let (config, _) = LatticeConfig::load();
        assert!(
            config
                .auth
                .public_prefixes
                .iter()
                .any(|prefix| prefix == "/health")
        );
    }
}
