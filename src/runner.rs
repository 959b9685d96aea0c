//! Runner Pool: N worker tasks that claim queue entries, spawn sandbox
//! children, and persist the resulting [`Run`].
//!
//! Grounded on the teacher's provider/sandbox split: [`runner::kind`]
//! picks the interpreter (like `SandboxProvider::create_sandbox` picking a
//! backend), [`runner::child`] spawns and bounds the process (like
//! `Sandbox::exec_stream`), and [`runner::protocol`] replaces the
//! teacher's stdout-line streaming with a single structured result line.

pub mod child;
pub mod kind;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertMessage, AlertSink, EscalationClient};
use crate::artifact::ArtifactStore;
use crate::bundled;
use crate::config::{SandboxConfig, SchedulerConfig};
use crate::model::{Run, RunStatus, SubjectId, Test};
use crate::state::{self, DebounceCounters, DebounceThresholds, Transition};
use crate::store::Store;

/// Known substrings that indicate a browser-infrastructure failure rather
/// than a genuine test failure (spec §4.3 step 6). Shared with the Domain
/// Monitor's browser probe, which runs the same sandbox child protocol.
pub(crate) const INFRA_SENTINELS: &[&str] = &[
    "target closed",
    "browser disconnected",
    "session closed",
    "page crashed",
    "navigation failed because browser has disconnected",
];

pub(crate) fn looks_like_infra_failure(message: &str) -> bool {
    let lowered = message.to_lowercase();
    INFRA_SENTINELS.iter().any(|s| lowered.contains(s))
}

pub struct RunnerPool {
    store: Store,
    artifacts: ArtifactStore,
    alert: Arc<dyn AlertSink>,
    escalation: Option<Arc<EscalationClient>>,
    sandbox: SandboxConfig,
    worker_count: usize,
}

impl RunnerPool {
    pub fn new(
        store: Store,
        artifacts: ArtifactStore,
        alert: Arc<dyn AlertSink>,
        escalation: Option<Arc<EscalationClient>>,
        sandbox: SandboxConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            alert,
            escalation,
            sandbox,
            worker_count: scheduler.worker_count,
        }
    }

    /// Spawns `worker_count` claim loops, returning their join handles so
    /// the caller can await them during graceful shutdown.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.worker_count)
            .map(|i| {
                let pool = Arc::clone(self);
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move { pool.worker_loop(worker_id).await })
            })
            .collect()
    }

    /// Spawns the lease-reclaim sweep (spec §4.3 crash recovery): entries
    /// still `leased` past their `leased_until_ts` mean the worker that
    /// held them is gone. Each reclaimed entry gets a synthetic
    /// `infra_degraded` Run so the State Engine sees neither a pass nor a
    /// fail for the lost run (testable property: restart never re-emits a
    /// DOWN alert for a subject already down, and never misreads a lost
    /// run as a recovery).
    pub fn spawn_lease_reclaimer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.lease_reclaim_loop().await })
    }

    async fn lease_reclaim_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(LEASE_RECLAIM_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match self.store.reclaim_abandoned_leases().await {
                Ok(entries) => {
                    for entry in entries {
                        warn!(test_id = %entry.test_id, "reclaiming abandoned lease, recording synthetic infra_degraded run");
                        if let Err(e) = self.record_abandoned_run(entry.test_id).await {
                            error!(error = %e, "failed to record synthetic run for abandoned lease");
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to reclaim abandoned leases"),
            }
        }
    }

    async fn record_abandoned_run(&self, test_id: Uuid) -> anyhow::Result<()> {
        let test = match self.store.get_test_by_id(test_id).await {
            Ok(test) => test,
            Err(_) => return Ok(()),
        };
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            test_id,
            scheduled_for_ts: now,
            started_at: now,
            finished_at: now,
            status: RunStatus::InfraDegraded,
            elapsed_ms: None,
            error_kind: Some("worker_crash".to_string()),
            error_message: Some(
                "run abandoned: worker lease expired before the run completed".to_string(),
            ),
            final_url: None,
            page_title: None,
            artifacts: Vec::new(),
        };
        self.store.insert_run(&run).await?;
        self.observe_and_alert(&test, run.status, run.error_message.as_deref()).await?;
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        loop {
            match self.store.claim_next(&worker_id, default_lease_seconds()).await {
                Ok(Some(entry)) => {
                    if let Err(e) = self.process_claim(&worker_id, entry.test_id, entry.id).await {
                        error!(worker = %worker_id, error = %e, "run processing failed");
                    }
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(250)).await,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "failed to claim from run queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_claim(
        &self,
        worker_id: &str,
        test_id: Uuid,
        queue_entry_id: Uuid,
    ) -> anyhow::Result<()> {
        let test = match self.store.get_test_by_id(test_id).await {
            Ok(test) => test,
            Err(_) => {
                warn!(%test_id, "claimed run for a test that no longer exists");
                self.store.mark_queue_entry_done(queue_entry_id).await?;
                return Ok(());
            }
        };

        if !test.enabled {
            self.store.mark_queue_entry_done(queue_entry_id).await?;
            return Ok(());
        }

        debug!(worker = %worker_id, test = %test.name, "running test");
        let run_id = Uuid::new_v4();
        let scheduled_for_ts = Utc::now();
        let started_at = Utc::now();

        let run = self.execute(&test, run_id, scheduled_for_ts, started_at).await?;
        self.store.insert_run(&run).await?;
        self.store.mark_queue_entry_done(queue_entry_id).await?;
        self.observe_and_alert(&test, run.status, run.error_message.as_deref()).await?;
        Ok(())
    }

    async fn execute(
        &self,
        test: &Test,
        run_id: Uuid,
        scheduled_for_ts: chrono::DateTime<Utc>,
        started_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Run> {
        let artifacts_dir = self
            .artifacts
            .prepare_run_dir(test.tenant_id, test.id, run_id)
            .await?;
        let source_path = self.artifacts.source_path(&test.source_blob_ref);
        let wrapper_path = bundled::wrapper_script_path(test.kind)?;

        let invocation = kind::build_invocation(
            test.kind,
            &self.sandbox,
            &wrapper_path,
            &source_path,
            &test.base_url,
            &artifacts_dir,
            test.timeout_seconds,
        );

        let env = vec![(
            "VIGIL_BROWSER_PATH".to_string(),
            self.sandbox.browser_executable_path.clone(),
        )];

        let child_run = child::run(&invocation, test.timeout_seconds, self.sandbox.grace_seconds, &env).await?;

        let finished_at = Utc::now();
        let elapsed_ms = (finished_at - started_at).num_milliseconds().max(0);

        let run = match child_run.outcome {
            child::Outcome::TimedOut => {
                self.write_run_log(test, run_id, &child_run.stdout_lines, &child_run.stderr_lines)
                    .await;
                Run {
                    id: run_id,
                    test_id: test.id,
                    scheduled_for_ts,
                    started_at,
                    finished_at,
                    status: RunStatus::Timeout,
                    elapsed_ms: Some(elapsed_ms),
                    error_kind: Some("timeout".to_string()),
                    error_message: Some(format!(
                        "sandbox child exceeded {}s + {}s grace",
                        test.timeout_seconds, self.sandbox.grace_seconds
                    )),
                    final_url: None,
                    page_title: None,
                    artifacts: self.artifacts.enumerate(test.tenant_id, test.id, run_id).await?,
                }
            }
            child::Outcome::Exited(_) => {
                self.write_run_log(test, run_id, &child_run.stdout_lines, &child_run.stderr_lines)
                    .await;
                match protocol::parse_result_line(&child_run.stdout_lines) {
                    Some(payload) => {
                        // The child already classifies infra-degraded failures
                        // (payload.browser_infra_error / status itself); the
                        // Runner additionally re-checks the message against
                        // its own sentinel list so a child that mis-classifies
                        // a message it didn't recognize still gets caught.
                        let mut status: RunStatus = payload.status.into();
                        if status == RunStatus::Fail
                            && payload
                                .error_message
                                .as_deref()
                                .is_some_and(looks_like_infra_failure)
                        {
                            status = RunStatus::InfraDegraded;
                            warn!(test = %test.name, "classified run as infra-degraded via sentinel match");
                        }
                        Run {
                            id: run_id,
                            test_id: test.id,
                            scheduled_for_ts,
                            started_at,
                            finished_at,
                            status,
                            elapsed_ms: Some(elapsed_ms),
                            error_kind: payload.error_kind,
                            error_message: payload.error_message,
                            final_url: payload.final_url,
                            page_title: payload.page_title,
                            artifacts: self.artifacts.enumerate(test.tenant_id, test.id, run_id).await?,
                        }
                    }
                    None => Run {
                        id: run_id,
                        test_id: test.id,
                        scheduled_for_ts,
                        started_at,
                        finished_at,
                        status: RunStatus::Fail,
                        elapsed_ms: Some(elapsed_ms),
                        error_kind: Some("runner_protocol".to_string()),
                        error_message: Some(
                            "sandbox child exited without a parsable E2E_RESULT_JSON line".to_string(),
                        ),
                        final_url: None,
                        page_title: None,
                        artifacts: self.artifacts.enumerate(test.tenant_id, test.id, run_id).await?,
                    },
                }
            }
        };

        Ok(run)
    }

    async fn write_run_log(&self, test: &Test, run_id: Uuid, stdout: &[String], stderr: &[String]) {
        let mut log = String::new();
        for line in stdout {
            log.push_str(line);
            log.push('\n');
        }
        for line in stderr {
            log.push_str("[stderr] ");
            log.push_str(line);
            log.push('\n');
        }
        if let Err(e) = self
            .artifacts
            .put(test.tenant_id, test.id, run_id, "run.log", log.as_bytes())
            .await
        {
            warn!(error = %e, "failed to write run.log artifact");
        }
    }

    /// Runs the run outcome through the State Engine, persists the updated
    /// state, and dispatches an alert on a debounced edge transition.
    async fn observe_and_alert(&self, test: &Test, status: RunStatus, error_message: Option<&str>) -> anyhow::Result<()> {
        let prior_state = self
            .store
            .get_test_state(test.id)
            .await?
            .unwrap_or_else(|| crate::model::TestState::fresh(test.id, Utc::now()));

        let thresholds = DebounceThresholds {
            down_after_failures: test.down_after_failures,
            up_after_successes: test.up_after_successes,
        };
        let counters = DebounceCounters {
            effective_ok: prior_state.effective_ok,
            fail_streak: prior_state.fail_streak,
            success_streak: prior_state.success_streak,
        };

        let observation = state::observe(counters, thresholds, status);
        let now = Utc::now();

        let mut new_state = prior_state;
        new_state.effective_ok = observation.counters.effective_ok;
        new_state.fail_streak = observation.counters.fail_streak;
        new_state.success_streak = observation.counters.success_streak;
        match status {
            RunStatus::Pass => new_state.last_ok_ts = Some(now),
            RunStatus::Fail | RunStatus::Timeout => new_state.last_fail_ts = Some(now),
            RunStatus::InfraDegraded => {}
        }

        if let Some(transition) = observation.transition {
            new_state.last_alert_ts = Some(now);
            self.dispatch_alert(test, transition, error_message).await;
        }

        self.store.save_test_state(&new_state).await?;
        Ok(())
    }

    async fn dispatch_alert(&self, test: &Test, transition: Transition, error_message: Option<&str>) {
        let summary = match transition {
            Transition::WentDown => format!(
                "test '{}' is now DOWN after {} consecutive failures",
                test.name, test.down_after_failures
            ),
            Transition::WentUp => format!(
                "test '{}' has recovered after {} consecutive passes",
                test.name, test.up_after_successes
            ),
        };
        let message = AlertMessage {
            subject: SubjectId::Test(test.id),
            transition,
            summary,
            detail: error_message.map(str::to_string),
        };
        if let Err(e) = self.alert.send_transition(&message).await {
            error!(error = %e, "failed to dispatch alert");
        } else {
            info!(test = %test.name, ?transition, "alert dispatched");
        }

        if transition == Transition::WentDown
            && let Some(escalation) = self.escalation.clone()
        {
            let alert = Arc::clone(&self.alert);
            let subject = SubjectId::Test(test.id);
            let subject_description = format!("test '{}' ({})", test.name, test.base_url);
            let failing_run_summary = error_message.unwrap_or("no error detail captured").to_string();
            tokio::spawn(async move {
                let prompt = EscalationClient::build_prompt(&subject_description, &failing_run_summary);
                match escalation.run(&prompt).await {
                    Ok(outcome) if outcome.timed_out => {
                        warn!(%subject, "escalation investigation timed out without a report");
                    }
                    Ok(outcome) => {
                        if let Some(report) = outcome.output
                            && let Err(e) = alert.send_escalation_report(&subject, &report).await
                        {
                            error!(%subject, error = %e, "failed to forward escalation report");
                        }
                    }
                    Err(e) => {
                        error!(%subject, error = %e, "escalation investigation failed");
                    }
                }
            });
        }
    }
}

/// Lease length used for every claim, regardless of the individual test's
/// `timeout_seconds`: `claim_next` doesn't know which test it will land on
/// until after the claim succeeds, so this uses a fixed upper bound
/// (`2 * Test::MAX_TIMEOUT_SECONDS` plus slack for sandbox startup) rather
/// than look up the test twice.
fn default_lease_seconds() -> i64 {
    2 * Test::MAX_TIMEOUT_SECONDS + 60
}

/// How often the lease-reclaim sweep runs. Independent of `tick_seconds`:
/// reclaiming is a safety net for crashed workers, not a scheduling path.
const LEASE_RECLAIM_INTERVAL_SECS: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::NullAlertSink;
    use crate::model::{EffectiveOk, TestKind, TestState};

    async fn seeded_pool() -> (RunnerPool, Test) {
        let store = Store::connect_in_memory().await.unwrap();
        let tenant = store.create_tenant("acme").await.unwrap();
        let now = Utc::now();
        let test = Test {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "checkout".into(),
            base_url: "https://example.com".into(),
            kind: TestKind::ScriptPython,
            enabled: true,
            disabled_reason: None,
            disabled_until_ts: None,
            interval_seconds: 300,
            timeout_seconds: 30,
            jitter_seconds: 10,
            down_after_failures: 2,
            up_after_successes: 2,
            source_blob_ref: "x".into(),
            created_at: now,
            updated_at: now,
        };
        store.insert_test(&test).await.unwrap();
        let mut state = TestState::fresh(test.id, now);
        state.effective_ok = EffectiveOk::Up;
        state.success_streak = 5;
        store.save_test_state(&state).await.unwrap();

        let pool = RunnerPool::new(
            store,
            ArtifactStore::new(std::env::temp_dir()),
            Arc::new(NullAlertSink),
            None,
            SandboxConfig::default(),
            &SchedulerConfig::default(),
        );
        (pool, test)
    }

    #[tokio::test]
    async fn abandoned_lease_records_neutral_run_and_preserves_state() {
        let (pool, test) = seeded_pool().await;
        pool.record_abandoned_run(test.id).await.unwrap();

        let runs = pool.store.list_runs_for_test(test.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::InfraDegraded);

        let state = pool.store.get_test_state(test.id).await.unwrap().unwrap();
        assert_eq!(state.effective_ok, EffectiveOk::Up);
        assert_eq!(state.success_streak, 5, "infra_degraded must not reset the success streak");
        assert_eq!(state.fail_streak, 0);
    }

    #[tokio::test]
    async fn abandoned_lease_for_deleted_test_is_a_no_op() {
        let (pool, _test) = seeded_pool().await;
        let ghost_id = Uuid::new_v4();
        pool.record_abandoned_run(ghost_id).await.unwrap();
        let runs = pool.store.list_runs_for_test(ghost_id, 10).await.unwrap();
        assert!(runs.is_empty());
    }
}
