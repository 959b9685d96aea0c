//! Domain Monitor: periodic HTTP + browser probes for a static,
//! file-configured list of first-party domains, feeding the same debounce
//! State Engine the Runner Pool uses for tenant tests.
//!
//! Grounded on [`crate::runner::RunnerPool`]'s tick-and-observe shape, but
//! single-task rather than worker-pool: the domain list is small and
//! probing is not queue-mediated (there is no durable run queue for
//! domains, only the in-memory reload watch below).

pub mod config;
pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertMessage, AlertSink, EscalationClient};
use crate::config::SandboxConfig;
use crate::model::{Domain, DomainState, RunStatus, SubjectId};
use crate::state::{self, DebounceCounters, DebounceThresholds, Transition};
use crate::store::Store;

pub struct DomainMonitor {
    store: Store,
    alert: Arc<dyn AlertSink>,
    escalation: Option<Arc<EscalationClient>>,
    sandbox: SandboxConfig,
    http_client: Client,
    domains: watch::Receiver<Vec<Domain>>,
}

impl DomainMonitor {
    pub fn new(
        store: Store,
        alert: Arc<dyn AlertSink>,
        escalation: Option<Arc<EscalationClient>>,
        sandbox: SandboxConfig,
        domains: watch::Receiver<Vec<Domain>>,
    ) -> Self {
        Self {
            store,
            alert,
            escalation,
            sandbox,
            http_client: Client::new(),
            domains,
        }
    }

    /// Spawns a `SIGHUP` listener that reloads `path` into `tx` whenever the
    /// process receives the signal, logging and keeping the previous list
    /// on a parse failure rather than probing nothing.
    #[cfg(unix)]
    pub fn spawn_reload_listener(path: std::path::PathBuf, tx: watch::Sender<Vec<Domain>>) -> anyhow::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            loop {
                sighup.recv().await;
                match config::load_domains(&path) {
                    Ok(domains) => {
                        info!(count = domains.len(), "reloaded domain monitor configuration");
                        let _ = tx.send(domains);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to reload domain monitor configuration, keeping previous list");
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "domain monitor tick failed");
                    }
                }
                _ = self.domains.changed() => {
                    debug!("domain monitor observed a configuration reload");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("domain monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let domains = self.domains.borrow().clone();
        for domain in &domains {
            if domain.disabled {
                continue;
            }
            if let Some(until) = domain.disabled_until_ts
                && until > now
            {
                continue;
            }

            let state = match self.store.get_domain_state(&domain.name).await? {
                Some(state) => state,
                None => DomainState::fresh(domain.name.clone(), now),
            };
            if state.next_due_ts > now {
                continue;
            }

            self.probe_and_observe(domain, state, now).await?;
        }
        Ok(())
    }

    async fn probe_and_observe(&self, domain: &Domain, mut state: DomainState, now: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        let outcome = probe::probe(&self.http_client, &self.sandbox, domain).await;
        debug!(domain = %domain.name, ?outcome.status, "domain probe completed");

        let thresholds = DebounceThresholds {
            down_after_failures: domain.down_after_failures,
            up_after_successes: domain.up_after_successes,
        };
        let counters = DebounceCounters {
            effective_ok: state.effective_ok,
            fail_streak: state.fail_streak,
            success_streak: state.success_streak,
        };
        let observation = state::observe(counters, thresholds, outcome.status);

        state.effective_ok = observation.counters.effective_ok;
        state.fail_streak = observation.counters.fail_streak;
        state.success_streak = observation.counters.success_streak;
        state.next_due_ts = now + chrono::Duration::seconds(domain.interval_seconds);
        match outcome.status {
            RunStatus::Pass => state.last_ok_ts = Some(now),
            RunStatus::Fail | RunStatus::Timeout => state.last_fail_ts = Some(now),
            RunStatus::InfraDegraded => {}
        }

        if let Some(transition) = observation.transition {
            state.last_alert_ts = Some(now);
            self.dispatch_alert(domain, transition, &outcome).await;
        }

        self.store.save_domain_state(&state).await?;
        Ok(())
    }

    async fn dispatch_alert(&self, domain: &Domain, transition: Transition, outcome: &probe::ProbeOutcome) {
        let summary = match transition {
            Transition::WentDown => format!(
                "domain '{}' is now DOWN after {} consecutive failures ({})",
                domain.name,
                domain.down_after_failures,
                outcome.error_message.as_deref().unwrap_or("no detail")
            ),
            Transition::WentUp => format!(
                "domain '{}' has recovered after {} consecutive successes",
                domain.name, domain.up_after_successes
            ),
        };
        let message = AlertMessage {
            subject: SubjectId::Domain(domain.name.clone()),
            transition,
            summary,
            detail: outcome.error_message.clone(),
        };
        if let Err(e) = self.alert.send_transition(&message).await {
            error!(error = %e, "failed to dispatch domain alert");
        } else {
            info!(domain = %domain.name, ?transition, "domain alert dispatched");
        }

        if transition == Transition::WentDown
            && let Some(escalation) = self.escalation.clone()
        {
            let alert = Arc::clone(&self.alert);
            let subject = SubjectId::Domain(domain.name.clone());
            let subject_description = format!("domain '{}' ({})", domain.name, domain.http_check_url);
            let failing_run_summary =
                outcome.error_message.clone().unwrap_or_else(|| "no error detail captured".to_string());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::NullAlertSink;

    fn sandbox() -> SandboxConfig {
        SandboxConfig {
            browser_executable_path: "/usr/bin/chromium".to_string(),
            python_interpreter: "python3".to_string(),
            node_interpreter: "node".to_string(),
            grace_seconds: 1,
        }
    }

    fn sample_domain(name: &str) -> Domain {
        Domain {
            name: name.to_string(),
            http_check_url: "http://192.0.2.1/healthz".to_string(),
            browser_check_enabled: false,
            interval_seconds: 60,
            timeout_seconds: 2,
            down_after_failures: 2,
            up_after_successes: 2,
            disabled: false,
            disabled_until_ts: None,
        }
    }

    #[tokio::test]
    async fn disabled_domain_is_skipped_by_tick() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut domain = sample_domain("disabled-domain");
        domain.disabled = true;
        let (_tx, rx) = watch::channel(vec![domain.clone()]);
        let monitor = DomainMonitor::new(store.clone(), Arc::new(NullAlertSink), None, sandbox(), rx);

        monitor.tick().await.unwrap();

        assert!(store.get_domain_state(&domain.name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistent_failure_transitions_domain_state_to_down() {
        let store = Store::connect_in_memory().await.unwrap();
        let (_tx, rx) = watch::channel(vec![]);
        let monitor = DomainMonitor::new(store.clone(), Arc::new(NullAlertSink), None, sandbox(), rx);
        let domain = sample_domain("flaky-domain");
        let now = Utc::now();

        let state = DomainState::fresh(domain.name.clone(), now);
        monitor.probe_and_observe(&domain, state, now).await.unwrap();
        let state = store.get_domain_state(&domain.name).await.unwrap().unwrap();
        assert_eq!(state.fail_streak, 1);

        monitor.probe_and_observe(&domain, state, now).await.unwrap();
        let state = store.get_domain_state(&domain.name).await.unwrap().unwrap();
        assert_eq!(state.effective_ok, crate::model::EffectiveOk::Down);
    }
}
