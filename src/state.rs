//! State & Alert Engine: the debounced UP/DOWN state machine shared by
//! both the external Test registry and the built-in Domain monitor.
//!
//! `observe` is the single entry point. It is pure with respect to its
//! inputs (a prior [`TestState`]/[`DomainState`]-shaped snapshot and a
//! [`RunStatus`]) so it can be unit tested without a store or clock; the
//! thin wrappers in [`crate::runner`] and [`crate::domain`] load the
//! snapshot, call this, persist the result, and dispatch the transition.

use chrono::{DateTime, Utc};

use crate::model::{EffectiveOk, RunStatus};

/// A debounce counter block, independent of whether the subject is a Test
/// or a Domain — both [`crate::model::TestState`] and
/// [`crate::model::DomainState`] project into this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceCounters {
    pub effective_ok: EffectiveOk,
    pub fail_streak: i64,
    pub success_streak: i64,
}

/// Thresholds configured per-subject (`down_after_failures` /
/// `up_after_successes` on the Test or Domain record).
#[derive(Debug, Clone, Copy)]
pub struct DebounceThresholds {
    pub down_after_failures: i64,
    pub up_after_successes: i64,
}

/// What happened as a result of an observation, beyond the raw counter
/// update: `None` means no edge was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentDown,
    WentUp,
}

pub struct Observation {
    pub counters: DebounceCounters,
    pub transition: Option<Transition>,
}

/// Applies one run outcome to the prior counters, returning the updated
/// counters and any edge transition.
///
/// `infra_degraded` is neutral: `last_fail_ts`-style bookkeeping happens in
/// the caller (which has the timestamp), but streaks are untouched here so
/// a run of browser crashes can never, by itself, produce a DOWN alert.
pub fn observe(
    prior: DebounceCounters,
    thresholds: DebounceThresholds,
    status: RunStatus,
) -> Observation {
    match status {
        RunStatus::InfraDegraded => Observation {
            counters: prior,
            transition: None,
        },
        RunStatus::Pass => {
            let success_streak = prior.success_streak + 1;
            let mut effective_ok = prior.effective_ok;
            let mut transition = None;
            if prior.effective_ok == EffectiveOk::Down
                && success_streak >= thresholds.up_after_successes
            {
                effective_ok = EffectiveOk::Up;
                transition = Some(Transition::WentUp);
            } else if prior.effective_ok == EffectiveOk::Unknown {
                effective_ok = EffectiveOk::Up;
            }
            Observation {
                counters: DebounceCounters {
                    effective_ok,
                    fail_streak: 0,
                    success_streak,
                },
                transition,
            }
        }
        RunStatus::Fail | RunStatus::Timeout => {
            let fail_streak = prior.fail_streak + 1;
            let mut effective_ok = prior.effective_ok;
            let mut transition = None;
            if prior.effective_ok != EffectiveOk::Down
                && fail_streak >= thresholds.down_after_failures
            {
                effective_ok = EffectiveOk::Down;
                transition = Some(Transition::WentDown);
            }
            Observation {
                counters: DebounceCounters {
                    effective_ok,
                    fail_streak,
                    success_streak: 0,
                },
                transition,
            }
        }
    }
}

/// Metadata carried alongside a [`Transition`] so the alert/escalation
/// pipeline can render something useful without re-querying the store.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub transition: Transition,
    pub last_ok_ts: Option<DateTime<Utc>>,
    pub last_fail_ts: Option<DateTime<Utc>>,
    pub reason_snippet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: DebounceThresholds = DebounceThresholds {
        down_after_failures: 2,
        up_after_successes: 2,
    };

    fn unknown() -> DebounceCounters {
        DebounceCounters {
            effective_ok: EffectiveOk::Unknown,
            fail_streak: 0,
            success_streak: 0,
        }
    }

    #[test]
    fn first_pass_from_unknown_goes_up_without_alert() {
        let result = observe(unknown(), THRESHOLDS, RunStatus::Pass);
        assert_eq!(result.counters.effective_ok, EffectiveOk::Up);
        assert_eq!(result.counters.success_streak, 1);
        assert!(result.transition.is_none(), "unknown -> up is not an alertable edge");
    }

    #[test]
    fn debounced_down_requires_threshold_failures() {
        let mut counters = observe(unknown(), THRESHOLDS, RunStatus::Pass).counters;
        let r1 = observe(counters, THRESHOLDS, RunStatus::Fail);
        assert_eq!(r1.counters.fail_streak, 1);
        assert!(r1.transition.is_none());
        counters = r1.counters;

        let r2 = observe(counters, THRESHOLDS, RunStatus::Fail);
        assert_eq!(r2.counters.fail_streak, 2);
        assert_eq!(r2.transition, Some(Transition::WentDown));
        assert_eq!(r2.counters.effective_ok, EffectiveOk::Down);
    }

    #[test]
    fn recovery_requires_threshold_successes() {
        let down = DebounceCounters {
            effective_ok: EffectiveOk::Down,
            fail_streak: 2,
            success_streak: 0,
        };
        let r1 = observe(down, THRESHOLDS, RunStatus::Pass);
        assert!(r1.transition.is_none());
        assert_eq!(r1.counters.effective_ok, EffectiveOk::Down);

        let r2 = observe(r1.counters, THRESHOLDS, RunStatus::Pass);
        assert_eq!(r2.transition, Some(Transition::WentUp));
        assert_eq!(r2.counters.effective_ok, EffectiveOk::Up);
    }

    #[test]
    fn infra_degraded_is_neutral_and_never_triggers_down() {
        let up = DebounceCounters {
            effective_ok: EffectiveOk::Up,
            fail_streak: 0,
            success_streak: 5,
        };
        let sequence = [
            RunStatus::Fail,
            RunStatus::InfraDegraded,
            RunStatus::InfraDegraded,
            RunStatus::Pass,
        ];
        let mut counters = up;
        for status in sequence {
            let result = observe(counters, THRESHOLDS, status);
            assert!(
                result.transition.is_none(),
                "no transition expected mid-sequence for {status:?}"
            );
            counters = result.counters;
        }
        assert_eq!(counters.effective_ok, EffectiveOk::Up);
    }

    #[test]
    fn timeout_counts_as_failure_like_fail() {
        let mut counters = unknown();
        counters.effective_ok = EffectiveOk::Up;
        let r1 = observe(counters, THRESHOLDS, RunStatus::Timeout);
        assert_eq!(r1.counters.fail_streak, 1);
        let r2 = observe(r1.counters, THRESHOLDS, RunStatus::Timeout);
        assert_eq!(r2.transition, Some(Transition::WentDown));
    }

    #[test]
    fn exactly_one_streak_positive_at_a_time() {
        let mut counters = unknown();
        for status in [RunStatus::Pass, RunStatus::Fail, RunStatus::Pass, RunStatus::Fail] {
            counters = observe(counters, THRESHOLDS, status).counters;
            assert!(
                counters.fail_streak == 0 || counters.success_streak == 0,
                "invariant violated: {counters:?}"
            );
        }
    }
}
