//! Durable metadata + state store.
//!
//! A single embedded SQLite database is the source of truth for tenants,
//! API keys, tests, debounce state, runs, and domain state. The durable
//! run queue lives alongside it in [`queue`]. All mutations are per-row
//! atomic; the queue additionally uses conditional updates so two workers
//! can never claim the same entry (see [`queue::claim_next`]).
//!
//! Enum columns are stored as their `snake_case` string form and converted
//! at the boundary; this keeps the schema readable with `sqlite3 store.db`
//! during development.

pub mod queue;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    ApiKey, DomainState, EffectiveOk, Run, RunStatus, Tenant, Test, TestKind, TestState,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value for column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the SQLite database at `path` and
    /// ensures the schema exists.
    pub async fn connect(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Io(e))
            })?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    // ---- Tenants & API keys -------------------------------------------------

    pub async fn create_tenant(&self, name: &str) -> StoreResult<Tenant> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO tenants (id, name, created_at) VALUES (?, ?, ?)")
            .bind(tenant.id.to_string())
            .bind(&tenant.name)
            .bind(tenant.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(tenant)
    }

    /// Creates an API key, returning the raw token. Only the hash is stored.
    pub async fn create_api_key(&self, tenant_id: Uuid) -> StoreResult<(ApiKey, String)> {
        let raw_token = format!("vigil_{}", Uuid::new_v4().simple());
        let key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id,
            token_hash: hash_token(&raw_token),
            created_at: Utc::now(),
            revoked_at: None,
        };
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, token_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key.id.to_string())
        .bind(key.tenant_id.to_string())
        .bind(&key.token_hash)
        .bind(key.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok((key, raw_token))
    }

    /// Resolves a raw bearer token to its owning tenant, if the key exists
    /// and has not been revoked.
    pub async fn tenant_for_token(&self, raw_token: &str) -> StoreResult<Option<Tenant>> {
        let hash = hash_token(raw_token);
        let row = sqlx::query(
            "SELECT t.id, t.name, t.created_at FROM api_keys k \
             JOIN tenants t ON t.id = k.tenant_id \
             WHERE k.token_hash = ? AND k.revoked_at IS NULL",
        )
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(tenant_from_row).transpose()
    }

    // ---- Tests ----------------------------------------------------------------

    pub async fn insert_test(&self, test: &Test) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO tests (id, tenant_id, name, base_url, kind, enabled, disabled_reason, \
             disabled_until_ts, interval_seconds, timeout_seconds, jitter_seconds, \
             down_after_failures, up_after_successes, source_blob_ref, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(test.id.to_string())
        .bind(test.tenant_id.to_string())
        .bind(&test.name)
        .bind(&test.base_url)
        .bind(test.kind.as_str())
        .bind(test.enabled)
        .bind(&test.disabled_reason)
        .bind(test.disabled_until_ts.map(|t| t.to_rfc3339()))
        .bind(test.interval_seconds)
        .bind(test.timeout_seconds)
        .bind(test.jitter_seconds)
        .bind(test.down_after_failures)
        .bind(test.up_after_successes)
        .bind(&test.source_blob_ref)
        .bind(test.created_at.to_rfc3339())
        .bind(test.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_test(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Test> {
        let row = sqlx::query("SELECT * FROM tests WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        test_from_row(row)
    }

    /// Looks up a test without knowing its tenant in advance. Used by the
    /// Scheduler and Runner Pool, which work off the run queue's bare
    /// `test_id` and have no tenant context of their own.
    pub async fn get_test_by_id(&self, id: Uuid) -> StoreResult<Test> {
        let row = sqlx::query("SELECT * FROM tests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        test_from_row(row)
    }

    pub async fn list_tests(&self, tenant_id: Uuid) -> StoreResult<Vec<Test>> {
        let rows = sqlx::query("SELECT * FROM tests WHERE tenant_id = ? ORDER BY created_at DESC")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(test_from_row).collect()
    }

    /// Every enabled test across every tenant; used by the Scheduler, which
    /// is not tenant-scoped.
    pub async fn list_enabled_tests(&self) -> StoreResult<Vec<Test>> {
        let rows = sqlx::query("SELECT * FROM tests WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(test_from_row).collect()
    }

    pub async fn update_test_schedule(&self, test: &Test) -> StoreResult<()> {
        sqlx::query(
            "UPDATE tests SET name = ?, base_url = ?, enabled = ?, disabled_reason = ?, \
             disabled_until_ts = ?, interval_seconds = ?, timeout_seconds = ?, jitter_seconds = ?, \
             down_after_failures = ?, up_after_successes = ?, updated_at = ? \
             WHERE id = ? AND tenant_id = ?",
        )
        .bind(&test.name)
        .bind(&test.base_url)
        .bind(test.enabled)
        .bind(&test.disabled_reason)
        .bind(test.disabled_until_ts.map(|t| t.to_rfc3339()))
        .bind(test.interval_seconds)
        .bind(test.timeout_seconds)
        .bind(test.jitter_seconds)
        .bind(test.down_after_failures)
        .bind(test.up_after_successes)
        .bind(Utc::now().to_rfc3339())
        .bind(test.id.to_string())
        .bind(test.tenant_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn replace_test_source(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        blob_ref: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE tests SET source_blob_ref = ?, updated_at = ? WHERE id = ? AND tenant_id = ?",
        )
        .bind(blob_ref)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Test state (debounce) --------------------------------------------

    pub async fn get_test_state(&self, test_id: Uuid) -> StoreResult<Option<TestState>> {
        let row = sqlx::query("SELECT * FROM test_states WHERE test_id = ?")
            .bind(test_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(test_state_from_row).transpose()
    }

    pub async fn save_test_state(&self, state: &TestState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO test_states (test_id, effective_ok, fail_streak, success_streak, \
             last_ok_ts, last_fail_ts, last_alert_ts, next_due_ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(test_id) DO UPDATE SET \
             effective_ok = excluded.effective_ok, fail_streak = excluded.fail_streak, \
             success_streak = excluded.success_streak, last_ok_ts = excluded.last_ok_ts, \
             last_fail_ts = excluded.last_fail_ts, last_alert_ts = excluded.last_alert_ts, \
             next_due_ts = excluded.next_due_ts",
        )
        .bind(state.test_id.to_string())
        .bind(effective_ok_to_str(state.effective_ok))
        .bind(state.fail_streak)
        .bind(state.success_streak)
        .bind(state.last_ok_ts.map(|t| t.to_rfc3339()))
        .bind(state.last_fail_ts.map(|t| t.to_rfc3339()))
        .bind(state.last_alert_ts.map(|t| t.to_rfc3339()))
        .bind(state.next_due_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Runs -----------------------------------------------------------------

    pub async fn insert_run(&self, run: &Run) -> StoreResult<()> {
        let artifacts_json = serde_json::to_string(&run.artifacts).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            "INSERT INTO runs (id, test_id, scheduled_for_ts, started_at, finished_at, status, \
             elapsed_ms, error_kind, error_message, final_url, page_title, artifacts_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(run.test_id.to_string())
        .bind(run.scheduled_for_ts.to_rfc3339())
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.to_rfc3339())
        .bind(run_status_to_str(run.status))
        .bind(run.elapsed_ms)
        .bind(&run.error_kind)
        .bind(&run.error_message)
        .bind(&run.final_url)
        .bind(&run.page_title)
        .bind(artifacts_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: Uuid) -> StoreResult<Run> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        run_from_row(row)
    }

    /// Looks up a run scoped to `tenant_id` via its owning test, so a run id
    /// belonging to another tenant resolves as `NotFound` rather than
    /// leaking whether the id exists (spec §4.1 auth contract).
    pub async fn get_run_for_tenant(&self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Run> {
        let row = sqlx::query(
            "SELECT runs.* FROM runs \
             JOIN tests ON tests.id = runs.test_id \
             WHERE runs.id = ? AND tests.tenant_id = ?",
        )
        .bind(run_id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        run_from_row(row)
    }

    pub async fn list_runs_for_test(&self, test_id: Uuid, limit: i64) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE test_id = ? ORDER BY finished_at DESC LIMIT ?",
        )
        .bind(test_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    pub async fn prune_runs_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM runs WHERE finished_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run ids whose `finished_at` is older than `cutoff`, so the retention
    /// sweep can remove their artifact directories independently of (and
    /// typically before) the run metadata row is pruned.
    pub async fn run_ids_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<(Uuid, Uuid, Uuid)>> {
        let rows = sqlx::query(
            "SELECT runs.id, runs.test_id, tests.tenant_id FROM runs \
             JOIN tests ON tests.id = runs.test_id \
             WHERE runs.finished_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let run_id: String = row.try_get("id")?;
                let test_id: String = row.try_get("test_id")?;
                let tenant_id: String = row.try_get("tenant_id")?;
                Ok((
                    Uuid::parse_str(&tenant_id)
                        .map_err(|_| StoreError::Corrupt { column: "tenant_id", value: tenant_id })?,
                    Uuid::parse_str(&test_id)
                        .map_err(|_| StoreError::Corrupt { column: "test_id", value: test_id })?,
                    Uuid::parse_str(&run_id)
                        .map_err(|_| StoreError::Corrupt { column: "id", value: run_id })?,
                ))
            })
            .collect()
    }

    // ---- Domain state (built-in uptime monitor) --------------------------

    pub async fn get_domain_state(&self, name: &str) -> StoreResult<Option<DomainState>> {
        let row = sqlx::query("SELECT * FROM domain_states WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(domain_state_from_row).transpose()
    }

    pub async fn save_domain_state(&self, state: &DomainState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO domain_states (name, effective_ok, fail_streak, success_streak, \
             last_ok_ts, last_fail_ts, last_alert_ts, next_due_ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
             effective_ok = excluded.effective_ok, fail_streak = excluded.fail_streak, \
             success_streak = excluded.success_streak, last_ok_ts = excluded.last_ok_ts, \
             last_fail_ts = excluded.last_fail_ts, last_alert_ts = excluded.last_alert_ts, \
             next_due_ts = excluded.next_due_ts",
        )
        .bind(&state.name)
        .bind(effective_ok_to_str(state.effective_ok))
        .bind(state.fail_streak)
        .bind(state.success_streak)
        .bind(state.last_ok_ts.map(|t| t.to_rfc3339()))
        .bind(state.last_fail_ts.map(|t| t.to_rfc3339()))
        .bind(state.last_alert_ts.map(|t| t.to_rfc3339()))
        .bind(state.next_due_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of Tests and Domains currently `effective_ok = down`, for the
    /// heartbeat summary's `failing_count`.
    pub async fn heartbeat_failing_count(&self) -> StoreResult<i64> {
        let tests: CountRow = sqlx::query_as("SELECT COUNT(*) AS n FROM test_states WHERE effective_ok = 'down'")
            .fetch_one(&self.pool)
            .await?;
        let domains: CountRow =
            sqlx::query_as("SELECT COUNT(*) AS n FROM domain_states WHERE effective_ok = 'down'")
                .fetch_one(&self.pool)
                .await?;
        Ok(tests.n + domains.n)
    }

    /// The `limit` enabled tests whose most recent run took the longest,
    /// for the heartbeat summary's `slowest_N`.
    pub async fn heartbeat_slowest_tests(&self, limit: i64) -> StoreResult<Vec<HeartbeatSlowEntry>> {
        let rows = sqlx::query(
            "SELECT t.name AS name, r.elapsed_ms AS elapsed_ms, ts.last_ok_ts AS last_ok_ts \
             FROM tests t \
             JOIN runs r ON r.id = ( \
                 SELECT r2.id FROM runs r2 WHERE r2.test_id = t.id ORDER BY r2.finished_at DESC LIMIT 1 \
             ) \
             LEFT JOIN test_states ts ON ts.test_id = t.id \
             WHERE t.enabled = 1 \
             ORDER BY r.elapsed_ms DESC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let name: String = row.try_get("name")?;
                let elapsed_ms: Option<i64> = row.try_get("elapsed_ms")?;
                let last_ok_ts: Option<String> = row.try_get("last_ok_ts")?;
                let last_ok_ts = last_ok_ts
                    .map(|s| {
                        chrono::DateTime::parse_from_rfc3339(&s)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|_| StoreError::Corrupt { column: "last_ok_ts", value: s })
                    })
                    .transpose()?;
                Ok(HeartbeatSlowEntry { subject_name: name, elapsed_ms, last_ok_ts })
            })
            .collect()
    }
}

/// One row of the heartbeat summary's `slowest_N` listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HeartbeatSlowEntry {
    pub subject_name: String,
    pub elapsed_ms: Option<i64>,
    pub last_ok_ts: Option<DateTime<Utc>>,
}

fn hash_token(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn effective_ok_to_str(v: EffectiveOk) -> &'static str {
    match v {
        EffectiveOk::Unknown => "unknown",
        EffectiveOk::Up => "up",
        EffectiveOk::Down => "down",
    }
}

fn effective_ok_from_str(s: &str) -> StoreResult<EffectiveOk> {
    match s {
        "unknown" => Ok(EffectiveOk::Unknown),
        "up" => Ok(EffectiveOk::Up),
        "down" => Ok(EffectiveOk::Down),
        other => Err(StoreError::Corrupt {
            column: "effective_ok",
            value: other.to_string(),
        }),
    }
}

fn run_status_to_str(v: RunStatus) -> &'static str {
    match v {
        RunStatus::Pass => "pass",
        RunStatus::Fail => "fail",
        RunStatus::InfraDegraded => "infra_degraded",
        RunStatus::Timeout => "timeout",
    }
}

fn run_status_from_str(s: &str) -> StoreResult<RunStatus> {
    match s {
        "pass" => Ok(RunStatus::Pass),
        "fail" => Ok(RunStatus::Fail),
        "infra_degraded" => Ok(RunStatus::InfraDegraded),
        "timeout" => Ok(RunStatus::Timeout),
        other => Err(StoreError::Corrupt {
            column: "status",
            value: other.to_string(),
        }),
    }
}

fn test_kind_from_str(s: &str) -> StoreResult<TestKind> {
    match s {
        "script_python" => Ok(TestKind::ScriptPython),
        "script_js" => Ok(TestKind::ScriptJs),
        other => Err(StoreError::Corrupt {
            column: "kind",
            value: other.to_string(),
        }),
    }
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column: "timestamp",
            value: s.to_string(),
        })
}

fn tenant_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Tenant> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Tenant {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::Corrupt {
            column: "id",
            value: id,
        })?,
        name: row.try_get("name")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn test_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Test> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let kind: String = row.try_get("kind")?;
    let disabled_until_ts: Option<String> = row.try_get("disabled_until_ts")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Test {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::Corrupt { column: "id", value: id })?,
        tenant_id: Uuid::parse_str(&tenant_id).map_err(|_| StoreError::Corrupt {
            column: "tenant_id",
            value: tenant_id,
        })?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        kind: test_kind_from_str(&kind)?,
        enabled: row.try_get("enabled")?,
        disabled_reason: row.try_get("disabled_reason")?,
        disabled_until_ts: disabled_until_ts.map(|s| parse_ts(&s)).transpose()?,
        interval_seconds: row.try_get("interval_seconds")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        jitter_seconds: row.try_get("jitter_seconds")?,
        down_after_failures: row.try_get("down_after_failures")?,
        up_after_successes: row.try_get("up_after_successes")?,
        source_blob_ref: row.try_get("source_blob_ref")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn test_state_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<TestState> {
    let test_id: String = row.try_get("test_id")?;
    let effective_ok: String = row.try_get("effective_ok")?;
    let last_ok_ts: Option<String> = row.try_get("last_ok_ts")?;
    let last_fail_ts: Option<String> = row.try_get("last_fail_ts")?;
    let last_alert_ts: Option<String> = row.try_get("last_alert_ts")?;
    let next_due_ts: String = row.try_get("next_due_ts")?;
    Ok(TestState {
        test_id: Uuid::parse_str(&test_id).map_err(|_| StoreError::Corrupt {
            column: "test_id",
            value: test_id,
        })?,
        effective_ok: effective_ok_from_str(&effective_ok)?,
        fail_streak: row.try_get("fail_streak")?,
        success_streak: row.try_get("success_streak")?,
        last_ok_ts: last_ok_ts.map(|s| parse_ts(&s)).transpose()?,
        last_fail_ts: last_fail_ts.map(|s| parse_ts(&s)).transpose()?,
        last_alert_ts: last_alert_ts.map(|s| parse_ts(&s)).transpose()?,
        next_due_ts: parse_ts(&next_due_ts)?,
    })
}

fn domain_state_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<DomainState> {
    let effective_ok: String = row.try_get("effective_ok")?;
    let last_ok_ts: Option<String> = row.try_get("last_ok_ts")?;
    let last_fail_ts: Option<String> = row.try_get("last_fail_ts")?;
    let last_alert_ts: Option<String> = row.try_get("last_alert_ts")?;
    let next_due_ts: String = row.try_get("next_due_ts")?;
    Ok(DomainState {
        name: row.try_get("name")?,
        effective_ok: effective_ok_from_str(&effective_ok)?,
        fail_streak: row.try_get("fail_streak")?,
        success_streak: row.try_get("success_streak")?,
        last_ok_ts: last_ok_ts.map(|s| parse_ts(&s)).transpose()?,
        last_fail_ts: last_fail_ts.map(|s| parse_ts(&s)).transpose()?,
        last_alert_ts: last_alert_ts.map(|s| parse_ts(&s)).transpose()?,
        next_due_ts: parse_ts(&next_due_ts)?,
    })
}

fn run_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Run> {
    let id: String = row.try_get("id")?;
    let test_id: String = row.try_get("test_id")?;
    let scheduled_for_ts: String = row.try_get("scheduled_for_ts")?;
    let started_at: String = row.try_get("started_at")?;
    let finished_at: String = row.try_get("finished_at")?;
    let status: String = row.try_get("status")?;
    let artifacts_json: String = row.try_get("artifacts_json")?;
    Ok(Run {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::Corrupt { column: "id", value: id })?,
        test_id: Uuid::parse_str(&test_id).map_err(|_| StoreError::Corrupt {
            column: "test_id",
            value: test_id,
        })?,
        scheduled_for_ts: parse_ts(&scheduled_for_ts)?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_ts(&finished_at)?,
        status: run_status_from_str(&status)?,
        elapsed_ms: row.try_get("elapsed_ms")?,
        error_kind: row.try_get("error_kind")?,
        error_message: row.try_get("error_message")?,
        final_url: row.try_get("final_url")?,
        page_title: row.try_get("page_title")?,
        artifacts: serde_json::from_str(&artifacts_json).unwrap_or_default(),
    })
}

/// Row shape shared by `test_states`/`domain_states`-style helper queries
/// that don't warrant a full hand-written mapper.
#[derive(FromRow)]
struct CountRow {
    #[sqlx(rename = "n")]
    n: i64,
}

/// Aggregate counts backing `GET /api/v1/status/summary` (spec §4.1:
/// `{tests_total, failing, slowest_N, last_run_per_tenant}`).
pub struct StatusSummary {
    pub tests_total: i64,
    pub tests_failing: i64,
    pub slowest: Vec<HeartbeatSlowEntry>,
    pub last_run_per_tenant: Vec<LastRunEntry>,
}

/// The most recently finished run for one tenant, across all of its tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LastRunEntry {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub run_id: Option<Uuid>,
    pub test_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Store {
    pub async fn status_summary(&self, slowest_n: i64) -> StoreResult<StatusSummary> {
        let total: CountRow = sqlx::query_as("SELECT COUNT(*) AS n FROM tests WHERE enabled = 1")
            .fetch_one(&self.pool)
            .await?;
        let failing: CountRow = sqlx::query_as(
            "SELECT COUNT(*) AS n FROM test_states WHERE effective_ok = 'down'",
        )
        .fetch_one(&self.pool)
        .await?;
        let slowest = self.heartbeat_slowest_tests(slowest_n).await?;
        let last_run_per_tenant = self.last_run_per_tenant().await?;
        Ok(StatusSummary {
            tests_total: total.n,
            tests_failing: failing.n,
            slowest,
            last_run_per_tenant,
        })
    }

    /// The latest finished run for each tenant, newest-first ordering left
    /// to the caller; tenants with no runs yet still appear, with `None`
    /// run fields.
    pub async fn last_run_per_tenant(&self) -> StoreResult<Vec<LastRunEntry>> {
        let rows = sqlx::query(
            "SELECT ten.id AS tenant_id, ten.name AS tenant_name, r.id AS run_id, \
             r.test_id AS test_id, r.status AS status, r.finished_at AS finished_at \
             FROM tenants ten \
             LEFT JOIN runs r ON r.id = ( \
                 SELECT r2.id FROM runs r2 \
                 JOIN tests t2 ON t2.id = r2.test_id \
                 WHERE t2.tenant_id = ten.id \
                 ORDER BY r2.finished_at DESC LIMIT 1 \
             ) \
             ORDER BY ten.name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let tenant_id: String = row.try_get("tenant_id")?;
                let run_id: Option<String> = row.try_get("run_id")?;
                let test_id: Option<String> = row.try_get("test_id")?;
                let status: Option<String> = row.try_get("status")?;
                let finished_at: Option<String> = row.try_get("finished_at")?;
                Ok(LastRunEntry {
                    tenant_id: Uuid::parse_str(&tenant_id)
                        .map_err(|_| StoreError::Corrupt { column: "tenant_id", value: tenant_id })?,
                    tenant_name: row.try_get("tenant_name")?,
                    run_id: run_id
                        .map(|s| Uuid::parse_str(&s).map_err(|_| StoreError::Corrupt { column: "run_id", value: s }))
                        .transpose()?,
                    test_id: test_id
                        .map(|s| Uuid::parse_str(&s).map_err(|_| StoreError::Corrupt { column: "test_id", value: s }))
                        .transpose()?,
                    status: status.map(|s| run_status_from_str(&s)).transpose()?,
                    finished_at: finished_at.map(|s| parse_ts(&s)).transpose()?,
                })
            })
            .collect()
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    token_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS tests (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id),
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    kind TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    disabled_reason TEXT,
    disabled_until_ts TEXT,
    interval_seconds INTEGER NOT NULL,
    timeout_seconds INTEGER NOT NULL,
    jitter_seconds INTEGER NOT NULL,
    down_after_failures INTEGER NOT NULL,
    up_after_successes INTEGER NOT NULL,
    source_blob_ref TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS test_states (
    test_id TEXT PRIMARY KEY REFERENCES tests(id),
    effective_ok TEXT NOT NULL,
    fail_streak INTEGER NOT NULL DEFAULT 0,
    success_streak INTEGER NOT NULL DEFAULT 0,
    last_ok_ts TEXT,
    last_fail_ts TEXT,
    last_alert_ts TEXT,
    next_due_ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_states (
    name TEXT PRIMARY KEY,
    effective_ok TEXT NOT NULL,
    fail_streak INTEGER NOT NULL DEFAULT 0,
    success_streak INTEGER NOT NULL DEFAULT 0,
    last_ok_ts TEXT,
    last_fail_ts TEXT,
    last_alert_ts TEXT,
    next_due_ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL REFERENCES tests(id),
    scheduled_for_ts TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    elapsed_ms INTEGER,
    error_kind TEXT,
    error_message TEXT,
    final_url TEXT,
    page_title TEXT,
    artifacts_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_runs_test_id ON runs(test_id, finished_at DESC);

CREATE TABLE IF NOT EXISTS run_queue (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL REFERENCES tests(id),
    due_ts TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    leased_by TEXT,
    leased_until_ts TEXT
);

CREATE INDEX IF NOT EXISTS idx_run_queue_status_due ON run_queue(status, due_ts);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_and_api_key_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant = store.create_tenant("acme").await.unwrap();
        let (_, raw_token) = store.create_api_key(tenant.id).await.unwrap();

        let resolved = store.tenant_for_token(&raw_token).await.unwrap();
        assert_eq!(resolved.unwrap().id, tenant.id);

        let bogus = store.tenant_for_token("not-a-real-token").await.unwrap();
        assert!(bogus.is_none());
    }

    #[tokio::test]
    async fn test_state_upsert_round_trips() {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant = store.create_tenant("acme").await.unwrap();
        let test = sample_test(tenant.id);
        store.insert_test(&test).await.unwrap();

        let mut state = TestState::fresh(test.id, Utc::now());
        state.fail_streak = 2;
        store.save_test_state(&state).await.unwrap();

        let loaded = store.get_test_state(test.id).await.unwrap().unwrap();
        assert_eq!(loaded.fail_streak, 2);

        state.fail_streak = 0;
        state.effective_ok = EffectiveOk::Up;
        store.save_test_state(&state).await.unwrap();
        let loaded = store.get_test_state(test.id).await.unwrap().unwrap();
        assert_eq!(loaded.fail_streak, 0);
        assert_eq!(loaded.effective_ok, EffectiveOk::Up);
    }

    #[tokio::test]
    async fn status_summary_includes_slowest_and_last_run_per_tenant() {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant = store.create_tenant("acme").await.unwrap();
        let other_tenant = store.create_tenant("globex").await.unwrap();
        let test = sample_test(tenant.id);
        store.insert_test(&test).await.unwrap();

        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            test_id: test.id,
            scheduled_for_ts: now,
            started_at: now,
            finished_at: now,
            status: RunStatus::Pass,
            elapsed_ms: Some(1234),
            error_kind: None,
            error_message: None,
            final_url: None,
            page_title: None,
            artifacts: vec![],
        };
        store.insert_run(&run).await.unwrap();

        let summary = store.status_summary(5).await.unwrap();
        assert_eq!(summary.tests_total, 1);
        assert_eq!(summary.tests_failing, 0);
        assert_eq!(summary.slowest.len(), 1);
        assert_eq!(summary.slowest[0].elapsed_ms, Some(1234));

        let mut by_tenant = summary.last_run_per_tenant;
        by_tenant.sort_by(|a, b| a.tenant_name.cmp(&b.tenant_name));
        assert_eq!(by_tenant.len(), 2);
        assert_eq!(by_tenant[0].tenant_id, tenant.id, "acme sorts before globex");
        assert_eq!(by_tenant[0].run_id, Some(run.id));
        assert_eq!(by_tenant[0].status, Some(RunStatus::Pass));
        assert_eq!(by_tenant[1].tenant_id, other_tenant.id);
        assert!(by_tenant[1].run_id.is_none(), "tenant with no runs yet still appears");
    }

    fn sample_test(tenant_id: Uuid) -> Test {
        let now = Utc::now();
        Test {
            id: Uuid::new_v4(),
            tenant_id,
            name: "homepage loads".to_string(),
            base_url: "https://example.com".to_string(),
            kind: TestKind::ScriptPython,
            enabled: true,
            disabled_reason: None,
            disabled_until_ts: None,
            interval_seconds: 300,
            timeout_seconds: 30,
            jitter_seconds: 10,
            down_after_failures: 2,
            up_after_successes: 2,
            source_blob_ref: "acme/homepage/source.py".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
