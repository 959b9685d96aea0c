//! Scheduler: the single cooperative loop that decides which Tests are due
//! and turns them into [`crate::model::RunQueueEntry`] rows.
//!
//! Grounded on the same `tokio::spawn` + tick-loop shape as
//! [`crate::runner::RunnerPool::worker_loop`], but single-instance rather
//! than fanned out across workers — spec §4.2 calls for a "single-writer
//! loop", and jitter/backoff math only makes sense computed once per tick.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::model::{Test, TestState};
use crate::store::Store;

pub struct Scheduler {
    store: Store,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Store, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Runs the tick loop until `shutdown` resolves. On shutdown, the loop
    /// stops issuing new jobs immediately (spec §5); in-flight runs are the
    /// Runner Pool's concern, not the Scheduler's.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_seconds.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping: no further runs will be enqueued");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let tests = self.store.list_enabled_tests().await?;
        let global_in_flight = self.store.count_in_flight_total().await?;
        if global_in_flight as usize >= self.config.global_max_parallel {
            debug!(global_in_flight, "scheduler tick: global concurrency cap reached, skipping scan");
            return Ok(());
        }

        let mut global_in_flight = global_in_flight as usize;
        for test in tests {
            if global_in_flight >= self.config.global_max_parallel {
                break;
            }

            let state = match self.store.get_test_state(test.id).await? {
                Some(state) => state,
                None => TestState::fresh(test.id, now),
            };

            if state.next_due_ts > now {
                continue;
            }

            let tenant_in_flight = self.store.count_in_flight_for_tenant(test.tenant_id).await?;
            if tenant_in_flight as usize >= self.config.per_tenant_max_parallel {
                // Leaves next_due_ts untouched so the test reappears next
                // tick rather than building up queue depth (spec §4.2 step 3).
                continue;
            }

            let next_due = compute_next_due(&test, &state, now, &self.config);
            let mut updated_state = state;
            updated_state.next_due_ts = next_due;
            self.store.save_test_state(&updated_state).await?;

            if self.store.enqueue_if_idle(test.id, now).await? {
                global_in_flight += 1;
                debug!(test = %test.name, next_due = %next_due, "enqueued run");
            }
            // If enqueue_if_idle returned false, a run for this test is
            // already queued or leased (single-in-flight-per-test
            // invariant); next_due_ts was still advanced so it doesn't spin.
        }

        Ok(())
    }
}

/// `now + interval + uniform(0, jitter)`, stretched by the backoff
/// multiplier when the test has been failing persistently (spec §4.2 step
/// 4). Backoff resets the moment a test isn't in a fail streak.
fn compute_next_due(
    test: &Test,
    state: &TestState,
    now: chrono::DateTime<Utc>,
    config: &SchedulerConfig,
) -> chrono::DateTime<Utc> {
    let jitter = if test.jitter_seconds > 0 {
        rand::thread_rng().gen_range(0..=test.jitter_seconds)
    } else {
        0
    };

    let interval = if state.fail_streak >= config.backoff_fail_streak_threshold {
        let stretched = test.interval_seconds as f64 * config.backoff_multiplier_ceiling;
        stretched.round() as i64
    } else {
        test.interval_seconds
    };

    now + chrono::Duration::seconds(interval + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EffectiveOk, TestKind};
    use uuid::Uuid;

    fn sample_test(interval_seconds: i64, jitter_seconds: i64) -> Test {
        let now = Utc::now();
        Test {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "t".into(),
            base_url: "https://example.com".into(),
            kind: TestKind::ScriptPython,
            enabled: true,
            disabled_reason: None,
            disabled_until_ts: None,
            interval_seconds,
            timeout_seconds: 30,
            jitter_seconds,
            down_after_failures: 2,
            up_after_successes: 2,
            source_blob_ref: "x".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_seconds: 1,
            global_max_parallel: 20,
            per_tenant_max_parallel: 4,
            backoff_fail_streak_threshold: 10,
            backoff_multiplier_ceiling: 4.0,
            worker_count: 4,
        }
    }

    #[test]
    fn next_due_without_jitter_is_exactly_interval_away() {
        let config = test_config();
        let test = sample_test(300, 0);
        let now = Utc::now();
        let state = TestState::fresh(test.id, now);
        let due = compute_next_due(&test, &state, now, &config);
        assert_eq!(due, now + chrono::Duration::seconds(300));
    }

    #[test]
    fn next_due_with_jitter_falls_within_bounds() {
        let config = test_config();
        let test = sample_test(300, 30);
        let now = Utc::now();
        let state = TestState::fresh(test.id, now);
        for _ in 0..20 {
            let due = compute_next_due(&test, &state, now, &config);
            let delta = (due - now).num_seconds();
            assert!((300..=330).contains(&delta), "delta {delta} out of bounds");
        }
    }

    #[test]
    fn persistent_failure_stretches_interval_up_to_ceiling() {
        let config = test_config();
        let test = sample_test(300, 0);
        let now = Utc::now();
        let mut state = TestState::fresh(test.id, now);
        state.fail_streak = 10;
        state.effective_ok = EffectiveOk::Down;
        let due = compute_next_due(&test, &state, now, &config);
        assert_eq!(due, now + chrono::Duration::seconds(1200));
    }
}
