use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SluiceError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub import_pool: PoolSettings,
    pub breaker: BreakerSettings,
    pub chunk: ChunkSettings,
    pub import: ImportSettings,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SLUICE_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SLUICE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            import_pool: PoolSettings::from_env_profiled(p),
            breaker: BreakerSettings::from_env_profiled(p),
            chunk: ChunkSettings::from_env_profiled(p),
            import: ImportSettings::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the importer cannot run with.
    pub fn validate(&self) -> Result<(), SluiceError> {
        if self.chunk.chunk_size == 0 {
            return Err(SluiceError::Config("CHUNK_SIZE must be greater than 0".into()));
        }
        if self.import.node_id >= 1024 {
            return Err(SluiceError::Config(format!(
                "NODE_ID must be below 1024, got {}",
                self.import.node_id
            )));
        }
        if self.storage.backend == "s3" && self.aws.s3_bucket.is_none() {
            return Err(SluiceError::Config("STORAGE_BACKEND=s3 requires S3_BUCKET".into()));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  import_pool: core={}, max={}, queue={}, prefix={}",
            self.import_pool.core_size,
            self.import_pool.max_size,
            self.import_pool.queue_size,
            self.import_pool.thread_prefix
        );
        tracing::info!(
            "  breaker:     threshold={}, retry_delay={}ms",
            self.breaker.error_threshold,
            self.breaker.retry_delay_ms
        );
        tracing::info!(
            "  chunk:       size={}, parallelism={}, queue={}",
            self.chunk.chunk_size,
            self.chunk.parallelism(),
            self.chunk.queue_capacity()
        );
        tracing::info!(
            "  import:      single_flight={}, node_id={}",
            self.import.single_flight,
            self.import.node_id
        );
        tracing::info!(
            "  storage:     backend={}, data_dir={}",
            self.storage.backend,
            self.storage.data_dir.display()
        );
        tracing::info!("  aws:         region={}, bucket={}", self.aws.region, self.aws.s3_bucket.as_deref().unwrap_or("(none)"));
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
    }
}

// ── Import pool ───────────────────────────────────────────────

/// Sizing of the pool that runs one managed worker per accepted import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub core_size: usize,
    pub max_size: usize,
    /// 0 = unbounded.
    pub queue_size: usize,
    pub keep_alive_secs: u64,
    pub thread_prefix: String,
    pub daemon: bool,
}

impl PoolSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            core_size: profiled_env_parse(p, "IMPORT_POOL_CORE_SIZE", 2),
            max_size: profiled_env_parse(p, "IMPORT_POOL_MAX_SIZE", 4),
            queue_size: profiled_env_parse(p, "IMPORT_POOL_QUEUE_SIZE", 16),
            keep_alive_secs: profiled_env_parse(p, "IMPORT_POOL_KEEP_ALIVE_SECS", 60),
            thread_prefix: profiled_env_or(p, "IMPORT_POOL_THREAD_PREFIX", "import-worker"),
            daemon: profiled_env_bool(p, "IMPORT_POOL_DAEMON", true),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

// ── Circuit breaker ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub error_threshold: usize,
    pub retry_delay_ms: u64,
}

impl BreakerSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            error_threshold: profiled_env_parse(p, "BREAKER_ERROR_THRESHOLD", 10),
            retry_delay_ms: profiled_env_parse(p, "BREAKER_RETRY_DELAY_MS", 1000),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ── Chunking ──────────────────────────────────────────────────

pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub chunk_size: usize,
    /// Chunk workers per import; 0 = available parallelism.
    pub parallelism: usize,
    /// Chunk queue capacity per import; 0 = twice the parallelism.
    pub queue_size: usize,
}

impl ChunkSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            chunk_size: profiled_env_parse(p, "CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            parallelism: profiled_env_parse(p, "CHUNK_PARALLELISM", 0),
            queue_size: profiled_env_parse(p, "CHUNK_QUEUE_SIZE", 0),
        }
    }

    pub fn parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn queue_capacity(&self) -> usize {
        if self.queue_size > 0 {
            self.queue_size
        } else {
            self.parallelism() * 2
        }
    }
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 0,
            queue_size: 0,
        }
    }
}

// ── Import coordinator ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Refuse a second in-flight import for the same source.
    pub single_flight: bool,
    /// Grace period for releasing a worker the pool refused.
    pub reject_shutdown_secs: u64,
    /// Row key node id (10 bits).
    pub node_id: u16,
}

impl ImportSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            single_flight: profiled_env_bool(p, "IMPORT_SINGLE_FLIGHT", true),
            reject_shutdown_secs: profiled_env_parse(p, "IMPORT_REJECT_SHUTDOWN_SECS", 10),
            node_id: profiled_env_parse(p, "NODE_ID", 0),
        }
    }

    pub fn reject_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.reject_shutdown_secs)
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            single_flight: true,
            reject_shutdown_secs: 10,
            node_id: 0,
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "local" or "s3".
    pub backend: String,
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            backend: profiled_env_or(p, "STORAGE_BACKEND", "local").to_lowercase(),
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            s3_bucket: profiled_env_opt(p, "S3_BUCKET"),
            s3_prefix: profiled_env_opt(p, "S3_PREFIX"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_parse(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "sluice"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_parse(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}
