//! Heartbeat scheduling: a periodic roll-up sent at configured wall-clock
//! anchors regardless of whether anything has transitioned.
//!
//! Anchors are expressed against a named IANA timezone so the next-fire
//! computation stays correct across DST transitions (spec §9); the
//! arithmetic itself lives in [`next_fire_after`], kept pure and unit
//! tested the same way [`crate::state::observe`] is.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::alert::{AlertSink, HeartbeatMessage};
use crate::config::HeartbeatConfig;
use crate::store::{HeartbeatSlowEntry, Store};

pub struct HeartbeatScheduler {
    store: Store,
    alert: std::sync::Arc<dyn AlertSink>,
    config: HeartbeatConfig,
}

impl HeartbeatScheduler {
    pub fn new(store: Store, alert: std::sync::Arc<dyn AlertSink>, config: HeartbeatConfig) -> Self {
        Self { store, alert, config }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let tz: Tz = match self.config.timezone.parse() {
            Ok(tz) => tz,
            Err(e) => {
                error!(timezone = %self.config.timezone, error = ?e, "invalid heartbeat timezone, heartbeat loop disabled");
                return;
            }
        };
        let anchors = match parse_anchors(&self.config.anchors) {
            Ok(anchors) if !anchors.is_empty() => anchors,
            Ok(_) => {
                warn!("no heartbeat anchors configured, heartbeat loop disabled");
                return;
            }
            Err(e) => {
                error!(error = %e, "invalid heartbeat anchor, heartbeat loop disabled");
                return;
            }
        };

        loop {
            let now = Utc::now();
            let next = next_fire_after(now, tz, &anchors);
            let sleep_duration = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "failed to send heartbeat");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> anyhow::Result<()> {
        let failing_count = self.store.heartbeat_failing_count().await?;
        let slowest = self.store.heartbeat_slowest_tests(self.config.slowest_n as i64).await?;
        let body = render_summary(failing_count, &slowest);
        self.alert.send_heartbeat(&HeartbeatMessage { body }).await?;
        info!(failing_count, "heartbeat sent");
        Ok(())
    }
}

fn render_summary(failing_count: i64, slowest: &[HeartbeatSlowEntry]) -> String {
    let mut body = format!("heartbeat: {failing_count} subject(s) currently down\n");
    if slowest.is_empty() {
        body.push_str("no runs recorded yet\n");
        return body;
    }
    body.push_str("slowest recent runs:\n");
    for entry in slowest {
        let elapsed = entry.elapsed_ms.map(|ms| format!("{ms}ms")).unwrap_or_else(|| "n/a".to_string());
        let last_ok = entry.last_ok_ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string());
        body.push_str(&format!("  {} - {elapsed} (last ok: {last_ok})\n", entry.subject_name));
    }
    body
}

fn parse_anchors(raw: &[String]) -> anyhow::Result<Vec<NaiveTime>> {
    raw.iter()
        .map(|s| {
            NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| anyhow::anyhow!("invalid anchor '{s}': {e}"))
        })
        .collect()
}

/// The smallest instant strictly after `now` at which the local wall-clock
/// time in `tz` matches one of `anchors`.
///
/// Walks forward one calendar day at a time (at most a handful of
/// iterations, since `anchors` is a short daily list) rather than doing
/// closed-form arithmetic, so DST transitions that skip or repeat a local
/// hour fall out of `TimeZone::from_local` naturally: an ambiguous or
/// nonexistent local time is resolved by taking the earliest valid mapping
/// `chrono-tz` offers.
fn next_fire_after(now: DateTime<Utc>, tz: Tz, anchors: &[NaiveTime]) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    for day_offset in 0..8 {
        let date = local_now.date_naive() + chrono::Duration::days(day_offset);
        for anchor in anchors {
            let naive = date.and_time(*anchor);
            let candidate = match tz.from_local_datetime(&naive) {
                chrono::LocalResult::Single(dt) => dt,
                chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                chrono::LocalResult::None => continue,
            };
            let candidate_utc = candidate.with_timezone(&Utc);
            if candidate_utc > now {
                return candidate_utc;
            }
        }
    }
    // Anchors list was non-empty and validated; this is unreachable in
    // practice but gives a safe fallback rather than panicking.
    now + chrono::Duration::hours(24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn next_fire_same_day_before_anchor() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let anchors = parse_anchors(&["09:00".to_string()]).unwrap();
        let next = next_fire_after(now, chrono_tz::UTC, &anchors);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_rolls_to_next_day_after_anchor() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let anchors = parse_anchors(&["09:00".to_string()]).unwrap();
        let next = next_fire_after(now, chrono_tz::UTC, &anchors);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn multiple_anchors_pick_the_nearest() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let anchors = parse_anchors(&["09:00".to_string(), "14:00".to_string()]).unwrap();
        let next = next_fire_after(now, chrono_tz::UTC, &anchors);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap());
    }

    #[test]
    fn dst_spring_forward_is_handled_without_panicking() {
        // US Eastern springs forward on 2026-03-08 at 02:00 -> 03:00; 02:30
        // never occurs locally that day.
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let anchors = parse_anchors(&["02:30".to_string()]).unwrap();
        let next = next_fire_after(now, tz, &anchors);
        assert!(next > now);
    }

    #[test]
    fn invalid_anchor_format_is_rejected() {
        assert!(parse_anchors(&["25:00".to_string()]).is_err());
    }

    #[test]
    fn summary_lists_slowest_entries_in_given_order() {
        let slowest = vec![
            HeartbeatSlowEntry { subject_name: "checkout".to_string(), elapsed_ms: Some(4200), last_ok_ts: None },
            HeartbeatSlowEntry { subject_name: "login".to_string(), elapsed_ms: Some(900), last_ok_ts: None },
        ];
        let body = render_summary(1, &slowest);
        assert!(body.contains("1 subject(s) currently down"));
        assert!(body.find("checkout").unwrap() < body.find("login").unwrap());
    }
}
