use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3040)
    pub port: u16,
    /// Database file path (default: ./coedit.db)
    pub database_path: PathBuf,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Presence entry TTL (default: 60s)
    pub presence_ttl: Duration,
    /// Block lock lease duration (default: 30s)
    pub lock_lease: Duration,
    /// Idempotency marker TTL (default: 300s)
    pub idempotency_ttl: Duration,
    /// Idle timeout after which a silent connection is closed (default: 300s)
    pub session_idle_timeout: Duration,
    /// Maximum number of operations in an initial-sync or catch-up payload (default: 100)
    pub sync_window: usize,
    /// Operation count above which a document's log is compacted (default: 1000)
    pub compaction_threshold: usize,
    /// Operations retained per document after compaction (default: 500)
    pub compaction_retain: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(env::var("DATABASE_PATH").unwrap_or_else(|_| "./coedit.db".to_string()));

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            cors_origins,
            presence_ttl: duration_from_env("PRESENCE_TTL_SECS", 60),
            lock_lease: duration_from_env("LOCK_LEASE_SECS", 30),
            idempotency_ttl: duration_from_env("IDEMPOTENCY_TTL_SECS", 300),
            session_idle_timeout: duration_from_env("SESSION_IDLE_TIMEOUT_SECS", 300),
            sync_window: usize_from_env("SYNC_WINDOW", 100),
            compaction_threshold: usize_from_env("COMPACTION_THRESHOLD", 1000),
            compaction_retain: usize_from_env("COMPACTION_RETAIN", 500),
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn duration_from_env(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn usize_from_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
