//! Application configuration.
//!
//! Loaded by the server binary from a TOML file merged with `DEPOT_`
//! environment variables. Everything has a serde default except the fork
//! table; `validate()` catches the mistakes that would otherwise surface
//! as garbage URLs or un-ingestable build trees at runtime.

use crate::name::valid_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::Duration;

/// Where download request logs go.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestLogStorage {
    /// Logging disabled.
    #[default]
    None,
    /// One structured log line per request.
    Console,
    /// Deduplicated rows in the content database.
    Database,
}

/// Content-store and download-protocol configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Content database file path.
    #[serde(default = "default_content_db")]
    pub database_file_name: PathBuf,
    /// Root of the on-disk build tree scanned by ingestion.
    #[serde(default = "default_disk_path")]
    pub version_disk_path: PathBuf,
    /// Fork served by the legacy unscoped `/version/...` routes.
    #[serde(default)]
    pub default_fork: Option<String>,
    /// Compress blobs on ingest.
    #[serde(default = "default_true")]
    pub blob_compress: bool,
    /// zstd level for blob compression.
    #[serde(default = "default_blob_compress_level")]
    pub blob_compress_level: i32,
    /// Minimum bytes a compressed blob must save to be stored compressed.
    #[serde(default = "default_savings_threshold")]
    pub blob_compress_savings_threshold: usize,
    /// zstd level for stored manifest text.
    #[serde(default = "default_manifest_compress_level")]
    pub manifest_compress_level: i32,
    /// Compress the whole download response stream.
    #[serde(default)]
    pub stream_compress: bool,
    /// zstd level for stream compression.
    #[serde(default = "default_stream_compress_level")]
    pub stream_compress_level: i32,
    /// Send stored-compressed blobs as-is, with per-file headers.
    #[serde(default = "default_true")]
    pub send_pre_compressed: bool,
    /// If > 0, pick stream vs. pre-compression from the ratio of requested
    /// entries to the version's distinct blobs.
    #[serde(default)]
    pub auto_stream_compress_ratio: f32,
    /// Record download requests at all.
    #[serde(default)]
    pub log_requests: bool,
    /// Request log sink.
    #[serde(default)]
    pub log_request_storage: RequestLogStorage,
}

/// Publish-workflow configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Publish database file path.
    #[serde(default = "default_publish_db")]
    pub database_file_name: PathBuf,
    /// Root of the on-disk build tree written by publishes.
    #[serde(default = "default_disk_path")]
    pub file_disk_path: PathBuf,
    /// Multi-request publishes older than this are aborted by the
    /// maintenance job.
    #[serde(default = "default_publish_timeout_minutes")]
    pub in_progress_publish_timeout_minutes: u64,
}

/// A downstream watchdog to POST update notifications to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Watchdog base URL.
    pub url: String,
    /// Instance name, also the Basic-auth username.
    pub instance: String,
    /// Basic-auth password.
    pub api_token: String,
}

/// Per-fork configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ForkConfig {
    /// Bearer token required by publish and update endpoints.
    #[serde(default)]
    pub update_token: Option<String>,
    /// Exact stem of the client zip inside published archives.
    #[serde(default = "default_client_zip_name")]
    pub client_zip_name: String,
    /// Prefix of server zips; the remainder before `.zip` is the platform.
    #[serde(default = "default_server_zip_name")]
    pub server_zip_name: String,
    /// Watchdogs notified after a fork's manifest cache is republished.
    #[serde(default)]
    pub notify_watchdogs: Vec<WatchdogConfig>,
    /// Reads require Basic auth against `private_users`.
    #[serde(default)]
    pub private: bool,
    /// Username to password map for private forks.
    #[serde(default)]
    pub private_users: BTreeMap<String, String>,
    /// Delete builds older than this many days; 0 disables pruning.
    #[serde(default)]
    pub prune_builds_days: u32,
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bind address (e.g. "127.0.0.1:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL, used in manifests and build.json. Must end with `/`.
    pub base_url: String,
    /// Optional URL path prefix the service is mounted under.
    #[serde(default)]
    pub path_base: Option<String>,
    /// Content store settings.
    #[serde(default)]
    pub content: ContentConfig,
    /// Publish workflow settings.
    #[serde(default)]
    pub publish: PublishConfig,
    /// Forks served by this instance.
    #[serde(default)]
    pub forks: BTreeMap<String, ForkConfig>,
}

impl AppConfig {
    /// Validate configuration invariants. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_url.ends_with('/') {
            return Err(format!("base_url must end with '/': {:?}", self.base_url));
        }
        for name in self.forks.keys() {
            if !valid_name(name) {
                return Err(format!("invalid fork name: {name:?}"));
            }
        }
        if let Some(default) = &self.content.default_fork {
            if !self.forks.contains_key(default) {
                return Err(format!("default_fork {default:?} is not a configured fork"));
            }
        }
        for level in [
            self.content.blob_compress_level,
            self.content.manifest_compress_level,
            self.content.stream_compress_level,
        ] {
            if !(1..=22).contains(&level) {
                return Err(format!("zstd level out of range 1..=22: {level}"));
            }
        }
        Ok(())
    }

    /// Timeout after which an in-progress publish is considered stale.
    pub fn publish_timeout(&self) -> Duration {
        let minutes = i64::try_from(self.publish.in_progress_publish_timeout_minutes)
            .unwrap_or(i64::MAX);
        Duration::minutes(minutes)
    }

    /// Create a test configuration with a single public fork.
    ///
    /// **For testing only.** Paths point at `root`.
    pub fn for_testing(root: &std::path::Path) -> Self {
        let mut forks = BTreeMap::new();
        forks.insert(
            "wizards".to_string(),
            ForkConfig {
                update_token: Some("test-update-token".to_string()),
                ..Default::default()
            },
        );
        Self {
            bind: default_bind(),
            base_url: "http://localhost/".to_string(),
            path_base: None,
            content: ContentConfig {
                database_file_name: root.join("content.db"),
                version_disk_path: root.join("builds"),
                ..Default::default()
            },
            publish: PublishConfig {
                database_file_name: root.join("publish.db"),
                file_disk_path: root.join("builds"),
                ..Default::default()
            },
            forks,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_content_db() -> PathBuf {
    PathBuf::from("content.db")
}

fn default_publish_db() -> PathBuf {
    PathBuf::from("publish.db")
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("builds")
}

fn default_true() -> bool {
    true
}

fn default_blob_compress_level() -> i32 {
    14
}

fn default_savings_threshold() -> usize {
    10
}

fn default_manifest_compress_level() -> i32 {
    14
}

fn default_stream_compress_level() -> i32 {
    5
}

fn default_publish_timeout_minutes() -> u64 {
    60
}

fn default_client_zip_name() -> String {
    "Client".to_string()
}

fn default_server_zip_name() -> String {
    "Server_".to_string()
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            database_file_name: default_content_db(),
            version_disk_path: default_disk_path(),
            default_fork: None,
            blob_compress: true,
            blob_compress_level: default_blob_compress_level(),
            blob_compress_savings_threshold: default_savings_threshold(),
            manifest_compress_level: default_manifest_compress_level(),
            stream_compress: false,
            stream_compress_level: default_stream_compress_level(),
            send_pre_compressed: true,
            auto_stream_compress_ratio: 0.0,
            log_requests: false,
            log_request_storage: RequestLogStorage::None,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            database_file_name: default_publish_db(),
            file_disk_path: default_disk_path(),
            in_progress_publish_timeout_minutes: default_publish_timeout_minutes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig::for_testing(std::path::Path::new("/tmp/depot-test"))
    }

    #[test]
    fn testing_config_validates() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn base_url_needs_trailing_slash() {
        let mut config = test_config();
        config.base_url = "http://localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_fork_must_exist() {
        let mut config = test_config();
        config.content.default_fork = Some("nope".to_string());
        assert!(config.validate().is_err());
        config.content.default_fork = Some("wizards".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fork_config_deserializes_with_defaults() {
        let fork: ForkConfig = serde_json::from_str(r#"{"private": true}"#).unwrap();
        assert!(fork.private);
        assert_eq!(fork.client_zip_name, "Client");
        assert_eq!(fork.server_zip_name, "Server_");
        assert_eq!(fork.prune_builds_days, 0);
    }

    #[test]
    fn zstd_levels_are_range_checked() {
        let mut config = test_config();
        config.content.blob_compress_level = 0;
        assert!(config.validate().is_err());
        config.content.blob_compress_level = 23;
        assert!(config.validate().is_err());
    }
}
