//! Configuration management for the callrelay engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// File and database storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Archive store configuration
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Ingestion gateway configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Live broadcast hub configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// Downstream relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// File and database storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for audio payloads and the database file
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Database file name, relative to `base_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum number of pooled database connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl StorageConfig {
    /// The sqlx connection URL for the archive database
    #[must_use]
    pub fn database_url(&self) -> String {
        let path = self.base_dir.join(&self.database_file);
        format!("sqlite://{}?mode=rwc", path.display())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            database_file: default_database_file(),
            max_connections: default_max_connections(),
        }
    }
}

/// Archive store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Two calls with identical (system, talkgroup, duration) and starts
    /// within this window collapse to one archived record
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// How often the per-System retention pruner runs
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    /// Auto-provision unknown Systems/Talkgroups/Units on first reference;
    /// when off, ingestion referencing an unknown System is rejected
    #[serde(default = "default_auto_provision")]
    pub auto_provision: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            auto_provision: default_auto_provision(),
        }
    }
}

/// Ingestion gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum accepted audio payload size in bytes
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: u64,

    /// Accepted audio codec tags / file extensions
    #[serde(default = "default_allowed_formats")]
    pub allowed_formats: Vec<String>,

    /// Directory-watch sources, one per watched path
    #[serde(default)]
    pub dirwatch: Vec<DirwatchConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_audio_bytes: default_max_audio_bytes(),
            allowed_formats: default_allowed_formats(),
            dirwatch: Vec::new(),
        }
    }
}

/// One directory-watch ingestion source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirwatchConfig {
    /// System all calls from this directory belong to
    pub system: i64,

    /// Watched directory
    pub path: PathBuf,

    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Move ingested files to `processed/` instead of deleting them
    #[serde(default)]
    pub keep_processed: bool,
}

/// Live broadcast hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Bounded per-client outbound queue capacity
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    /// How often the liveness reaper runs
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// A client silent longer than this is forcibly disconnected
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: default_client_queue_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
        }
    }
}

/// Downstream relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// First retry delay in seconds; doubles on each consecutive failure
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Retry delay ceiling in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Consecutive failures after which a target is disabled
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Bounded per-target pending queue capacity
    #[serde(default = "default_target_queue_capacity")]
    pub target_queue_capacity: usize,

    /// Request timeout for a single forward attempt, seconds
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Shutdown grace for in-flight downstream sends, seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            target_queue_capacity: default_target_queue_capacity(),
            send_timeout_secs: default_send_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json or text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database_file() -> String {
    "callrelay.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

const fn default_dedup_window_secs() -> u64 {
    2
}

const fn default_prune_interval_secs() -> u64 {
    300
}

const fn default_auto_provision() -> bool {
    true
}

const fn default_max_audio_bytes() -> u64 {
    100_000_000 // 100MB
}

fn default_allowed_formats() -> Vec<String> {
    vec!["mp3".to_string(), "wav".to_string(), "m4a".to_string()]
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_client_queue_capacity() -> usize {
    32
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_heartbeat_grace_secs() -> u64 {
    60
}

const fn default_backoff_base_secs() -> u64 {
    5
}

const fn default_backoff_cap_secs() -> u64 {
    300
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_target_queue_capacity() -> usize {
    64
}

const fn default_send_timeout_secs() -> u64 {
    30
}

const fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from `config.*` files and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed.
    pub fn load() -> crate::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("CALLRELAY").separator("_"))
            .build()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::field_reassign_with_default)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.storage.base_dir, PathBuf::from("./data"));
        assert_eq!(config.storage.database_file, "callrelay.db");
        assert_eq!(config.storage.max_connections, 5);

        assert_eq!(config.archive.dedup_window_secs, 2);
        assert_eq!(config.archive.prune_interval_secs, 300);
        assert!(config.archive.auto_provision);

        assert_eq!(config.ingest.max_audio_bytes, 100_000_000);
        assert_eq!(config.ingest.allowed_formats, vec!["mp3", "wav", "m4a"]);
        assert!(config.ingest.dirwatch.is_empty());

        assert_eq!(config.hub.client_queue_capacity, 32);
        assert_eq!(config.hub.heartbeat_interval_secs, 30);
        assert_eq!(config.hub.heartbeat_grace_secs, 60);

        assert_eq!(config.relay.backoff_base_secs, 5);
        assert_eq!(config.relay.backoff_cap_secs, 300);
        assert_eq!(config.relay.max_consecutive_failures, 5);
        assert_eq!(config.relay.target_queue_capacity, 64);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_database_url() {
        let storage = StorageConfig {
            base_dir: PathBuf::from("/var/lib/callrelay"),
            database_file: "calls.db".to_string(),
            max_connections: 5,
        };

        assert_eq!(
            storage.database_url(),
            "sqlite:///var/lib/callrelay/calls.db?mode=rwc"
        );
    }

    #[test]
    fn test_partial_config_deserialization() {
        let json_str = r#"{
            "storage": {"base_dir": "/tmp/cr"},
            "archive": {"dedup_window_secs": 5},
            "ingest": {
                "dirwatch": [{"system": 1, "path": "/watch"}]
            }
        }"#;

        let config: Config = serde_json::from_str(json_str).unwrap();

        assert_eq!(config.storage.base_dir, PathBuf::from("/tmp/cr"));
        assert_eq!(config.storage.database_file, "callrelay.db"); // default
        assert_eq!(config.archive.dedup_window_secs, 5);
        assert_eq!(config.archive.prune_interval_secs, 300); // default

        assert_eq!(config.ingest.dirwatch.len(), 1);
        let watch = &config.ingest.dirwatch[0];
        assert_eq!(watch.system, 1);
        assert_eq!(watch.poll_interval_ms, 1000); // default
        assert!(!watch.keep_processed);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = Config::default();
        config.ingest.dirwatch.push(DirwatchConfig {
            system: 7,
            path: PathBuf::from("/recordings"),
            poll_interval_ms: 500,
            keep_processed: true,
        });

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.ingest.dirwatch.len(), 1);
        assert_eq!(parsed.ingest.dirwatch[0].system, 7);
        assert_eq!(parsed.ingest.dirwatch[0].poll_interval_ms, 500);
        assert!(parsed.ingest.dirwatch[0].keep_processed);
    }

    #[test]
    fn test_config_bounds() {
        let config = Config::default();

        assert!(config.storage.max_connections > 0);
        assert!(config.archive.dedup_window_secs > 0);
        assert!(config.hub.client_queue_capacity > 0);
        assert!(config.hub.heartbeat_grace_secs >= config.hub.heartbeat_interval_secs);
        assert!(config.relay.backoff_cap_secs >= config.relay.backoff_base_secs);
        assert!(config.relay.max_consecutive_failures > 0);
    }
}
