//! Configuration schema for the `vigil` server process.
//!
//! Deserialized once at startup from a TOML file (default `vigil.toml`).
//! Every optional field carries a `#[serde(default = "...")]` so a minimal
//! file only needs to set `listen_addr` and the secrets.
//!
//! ```text
//! Config (root)
//! ├── store           - SQLite path, artifact directory, retention
//! ├── scheduler        - tick cadence, concurrency caps, backoff
//! ├── sandbox          - browser executable, grace period
//! ├── alert_transport   - chat API credentials, chunking
//! ├── escalation        - optional investigative-agent dispatcher
//! ├── heartbeat         - IANA timezone + daily anchors
//! └── auth              - admin/monitor bearer tokens
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the Registry API listens on, e.g. `"0.0.0.0:8080"`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    pub alert_transport: AlertTransportConfig,

    #[serde(default)]
    pub escalation: Option<EscalationConfig>,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    pub auth: AuthConfig,

    /// Path to the separate, SIGHUP-reloadable domain monitor config.
    #[serde(default = "default_domains_path")]
    pub domains_config_path: PathBuf,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_domains_path() -> PathBuf {
    PathBuf::from("domains.toml")
}

/// Where persistent state lives. The store is a single embedded SQLite
/// database; artifacts live in a plain directory tree underneath it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Run metadata older than this is pruned by the retention sweep.
    #[serde(default = "default_run_retention_days")]
    pub run_retention_days: i64,

    /// Artifact blobs older than this are pruned independently of run
    /// metadata; a missing artifact on an otherwise-retained run is expected.
    #[serde(default = "default_artifact_retention_days")]
    pub artifact_retention_days: i64,

    /// Maximum accepted size, in bytes, of an uploaded test source file.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            run_retention_days: default_run_retention_days(),
            artifact_retention_days: default_artifact_retention_days(),
            max_source_bytes: default_max_source_bytes(),
        }
    }
}

impl StoreConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("store.db")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_run_retention_days() -> i64 {
    90
}
fn default_artifact_retention_days() -> i64 {
    14
}
fn default_max_source_bytes() -> usize {
    256 * 1024
}

/// Scheduler tick behavior: how often it scans, how many runs may be
/// in flight, and how failing tests get backed off.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default = "default_global_max_parallel")]
    pub global_max_parallel: usize,

    #[serde(default = "default_tenant_max_parallel")]
    pub per_tenant_max_parallel: usize,

    /// `fail_streak` at or above which the next due time is stretched.
    #[serde(default = "default_backoff_threshold")]
    pub backoff_fail_streak_threshold: i64,

    /// Upper bound on the interval multiplier applied during backoff.
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_multiplier_ceiling: f64,

    /// How many worker tasks claim from the run queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            global_max_parallel: default_global_max_parallel(),
            per_tenant_max_parallel: default_tenant_max_parallel(),
            backoff_fail_streak_threshold: default_backoff_threshold(),
            backoff_multiplier_ceiling: default_backoff_ceiling(),
            worker_count: default_worker_count(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    1
}
fn default_global_max_parallel() -> usize {
    20
}
fn default_tenant_max_parallel() -> usize {
    4
}
fn default_backoff_threshold() -> i64 {
    10
}
fn default_backoff_ceiling() -> f64 {
    4.0
}
fn default_worker_count() -> usize {
    4
}

/// Settings passed through to every sandbox child process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Path to the headless browser executable. Supports `${VAR}` expansion.
    #[serde(default = "default_browser_path")]
    pub browser_executable_path: String,

    /// Python interpreter used for `script_python` tests.
    #[serde(default = "default_python_interpreter")]
    pub python_interpreter: String,

    /// Node interpreter used for `script_js` tests.
    #[serde(default = "default_node_interpreter")]
    pub node_interpreter: String,

    /// Extra seconds allowed past `timeout_seconds` before a hard kill.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            browser_executable_path: default_browser_path(),
            python_interpreter: default_python_interpreter(),
            node_interpreter: default_node_interpreter(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

fn default_browser_path() -> String {
    "${VIGIL_BROWSER_PATH:-/usr/bin/chromium}".to_string()
}
fn default_python_interpreter() -> String {
    "python3".to_string()
}
fn default_node_interpreter() -> String {
    "node".to_string()
}
fn default_grace_seconds() -> u64 {
    5
}

/// Credentials and chunking policy for the outbound chat alert transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertTransportConfig {
    pub api_base_url: String,
    pub api_token: String,

    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
}

fn default_chunk_max_chars() -> usize {
    4096
}

/// Optional escalation dispatcher invoked on DOWN transitions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EscalationConfig {
    pub endpoint: String,
    pub token: String,
    pub model: String,

    #[serde(default = "default_escalation_poll_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_escalation_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_escalation_poll_seconds() -> u64 {
    15
}
fn default_escalation_timeout_seconds() -> u64 {
    7200
}

/// Daily anchors, in a single IANA timezone, at which a heartbeat summary
/// is sent regardless of whether any subject transitioned.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_timezone")]
    pub timezone: String,

    /// `"HH:MM"` anchors in the configured timezone.
    #[serde(default = "default_heartbeat_anchors")]
    pub anchors: Vec<String>,

    #[serde(default = "default_heartbeat_slowest_n")]
    pub slowest_n: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timezone: default_heartbeat_timezone(),
            anchors: default_heartbeat_anchors(),
            slowest_n: default_heartbeat_slowest_n(),
        }
    }
}

fn default_heartbeat_timezone() -> String {
    "UTC".to_string()
}
fn default_heartbeat_anchors() -> Vec<String> {
    vec!["09:00".to_string()]
}
fn default_heartbeat_slowest_n() -> usize {
    5
}

/// Bearer tokens for privileged scopes. Tenant scopes come from the
/// [`crate::model::ApiKey`] table, not from this file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub admin_token: String,
    pub monitor_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            listen_addr = "127.0.0.1:9000"

            [alert_transport]
            api_base_url = "https://chat.example.com"
            api_token = "secret"

            [auth]
            admin_token = "admin-secret"
            monitor_token = "monitor-secret"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.scheduler.worker_count, 4);
        assert_eq!(config.store.artifact_retention_days, 14);
        assert_eq!(config.store.run_retention_days, 90);
        assert_eq!(config.heartbeat.timezone, "UTC");
    }

    #[test]
    fn store_config_derives_paths_under_data_dir() {
        let store = StoreConfig {
            data_dir: PathBuf::from("/var/lib/vigil"),
            ..Default::default()
        };
        assert_eq!(store.sqlite_path(), PathBuf::from("/var/lib/vigil/store.db"));
        assert_eq!(store.artifacts_dir(), PathBuf::from("/var/lib/vigil/artifacts"));
    }
}
