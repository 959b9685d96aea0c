//! Core data model shared by the Registry API, Scheduler, Runner Pool, and
//! State & Alert Engine.
//!
//! These types mirror the rows of the durable store (see [`crate::store`])
//! and are intentionally flat: nothing here holds a reference to another
//! row, subjects are looked up by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant owns tests and API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An API key is shown in raw form exactly once, at creation. Afterwards
/// only its hash is compared against incoming `Authorization` headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// The kind of sandbox a test's source file expects to run under.
///
/// Determines both the wrapper script ([`crate::bundled`]) used to execute
/// it and the file extension a new upload must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    ScriptPython,
    ScriptJs,
}

impl TestKind {
    /// The file extension an uploaded source file must carry for this kind.
    pub fn expected_extension(&self) -> &'static str {
        match self {
            TestKind::ScriptPython => "py",
            TestKind::ScriptJs => "js",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::ScriptPython => "script_python",
            TestKind::ScriptJs => "script_js",
        }
    }
}

/// A tenant-owned end-to-end test definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub base_url: String,
    pub kind: TestKind,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub disabled_until_ts: Option<DateTime<Utc>>,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub jitter_seconds: i64,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    /// Path (relative to the artifact store root) of the uploaded source.
    pub source_blob_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Test {
    /// Schedule bounds named in the spec: 60..=3600 seconds.
    pub const MIN_INTERVAL_SECONDS: i64 = 60;
    pub const MAX_INTERVAL_SECONDS: i64 = 3600;
    pub const MIN_TIMEOUT_SECONDS: i64 = 1;
    pub const MAX_TIMEOUT_SECONDS: i64 = 300;
}

/// Whether a subject (test or domain) is currently considered reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveOk {
    Unknown,
    Up,
    Down,
}

/// Debounced state for a single Test. One row per test, created on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestState {
    pub test_id: Uuid,
    pub effective_ok: EffectiveOk,
    pub fail_streak: i64,
    pub success_streak: i64,
    pub last_ok_ts: Option<DateTime<Utc>>,
    pub last_fail_ts: Option<DateTime<Utc>>,
    pub last_alert_ts: Option<DateTime<Utc>>,
    pub next_due_ts: DateTime<Utc>,
}

impl TestState {
    pub fn fresh(test_id: Uuid, next_due_ts: DateTime<Utc>) -> Self {
        Self {
            test_id,
            effective_ok: EffectiveOk::Unknown,
            fail_streak: 0,
            success_streak: 0,
            last_ok_ts: None,
            last_fail_ts: None,
            last_alert_ts: None,
            next_due_ts,
        }
    }
}

/// Terminal outcome of a single sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Fail,
    InfraDegraded,
    Timeout,
}

/// A finished (or abandoned) execution of a Test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub test_id: Uuid,
    pub scheduled_for_ts: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub elapsed_ms: Option<i64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub final_url: Option<String>,
    pub page_title: Option<String>,
    /// Artifact names written for this run (e.g. `failure.png`, `run.log`).
    pub artifacts: Vec<String>,
}

/// A static, file-configured first-party domain watched by the built-in
/// uptime monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub http_check_url: String,
    pub browser_check_enabled: bool,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    pub disabled: bool,
    pub disabled_until_ts: Option<DateTime<Utc>>,
}

/// Debounced state for a Domain. Mirrors [`TestState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainState {
    pub name: String,
    pub effective_ok: EffectiveOk,
    pub fail_streak: i64,
    pub success_streak: i64,
    pub last_ok_ts: Option<DateTime<Utc>>,
    pub last_fail_ts: Option<DateTime<Utc>>,
    pub last_alert_ts: Option<DateTime<Utc>>,
    pub next_due_ts: DateTime<Utc>,
}

impl DomainState {
    pub fn fresh(name: String, next_due_ts: DateTime<Utc>) -> Self {
        Self {
            name,
            effective_ok: EffectiveOk::Unknown,
            fail_streak: 0,
            success_streak: 0,
            last_ok_ts: None,
            last_fail_ts: None,
            last_alert_ts: None,
            next_due_ts,
        }
    }
}

/// Status of a durable run-queue entry. Leases are time-bounded so a
/// crashed worker's claim is eventually reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Leased,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueueEntry {
    pub id: Uuid,
    pub test_id: Uuid,
    pub due_ts: DateTime<Utc>,
    pub attempt: i64,
    pub status: QueueStatus,
    pub leased_by: Option<String>,
    pub leased_until_ts: Option<DateTime<Utc>>,
}

/// The subject of a debounce observation: either a tenant Test or a
/// built-in Domain. Kept distinct from `Uuid`/`String` so the State Engine
/// never confuses the two id spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectId {
    Test(Uuid),
    Domain(String),
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectId::Test(id) => write!(f, "test:{id}"),
            SubjectId::Domain(name) => write!(f, "domain:{name}"),
        }
    }
}
