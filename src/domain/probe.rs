//! Per-domain probe: HTTP liveness, optionally followed by a minimal
//! headless-browser expectation check run through the same sandbox child
//! protocol the Runner Pool uses for tenant tests.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::bundled;
use crate::config::SandboxConfig;
use crate::model::{Domain, RunStatus};
use crate::runner::child;
use crate::runner::kind::{self, ChildInvocation};
use crate::runner::{looks_like_infra_failure, protocol};

pub struct ProbeOutcome {
    pub status: RunStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub elapsed_ms: i64,
}

/// Runs the HTTP liveness check, then the browser check if enabled and the
/// liveness check passed. A domain with `browser_check_enabled = false`
/// never spawns a sandbox child.
pub async fn probe(http_client: &Client, sandbox: &SandboxConfig, domain: &Domain) -> ProbeOutcome {
    let start = std::time::Instant::now();

    if let Err(e) = probe_http(http_client, domain).await {
        return ProbeOutcome {
            status: RunStatus::Fail,
            error_kind: Some("http_liveness".to_string()),
            error_message: Some(e),
            elapsed_ms: start.elapsed().as_millis() as i64,
        };
    }

    if !domain.browser_check_enabled {
        return ProbeOutcome {
            status: RunStatus::Pass,
            error_kind: None,
            error_message: None,
            elapsed_ms: start.elapsed().as_millis() as i64,
        };
    }

    let outcome = probe_browser(sandbox, domain).await;
    ProbeOutcome {
        elapsed_ms: start.elapsed().as_millis() as i64,
        ..outcome
    }
}

async fn probe_http(http_client: &Client, domain: &Domain) -> Result<(), String> {
    let response = http_client
        .get(&domain.http_check_url)
        .timeout(Duration::from_secs(domain.timeout_seconds.max(1) as u64))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status: {}", response.status()))
    }
}

async fn probe_browser(sandbox: &SandboxConfig, domain: &Domain) -> ProbeOutcome {
    let wrapper_path = match bundled::wrapper_script_path(crate::model::TestKind::ScriptJs) {
        Ok(p) => p,
        Err(e) => {
            return ProbeOutcome {
                status: RunStatus::Fail,
                error_kind: Some("runner_protocol".to_string()),
                error_message: Some(format!("failed to extract js sandbox wrapper: {e}")),
                elapsed_ms: 0,
            };
        }
    };
    let script_path = match bundled::domain_browser_check_script_path() {
        Ok(p) => p,
        Err(e) => {
            return ProbeOutcome {
                status: RunStatus::Fail,
                error_kind: Some("runner_protocol".to_string()),
                error_message: Some(format!("failed to extract domain browser check script: {e}")),
                elapsed_ms: 0,
            };
        }
    };

    let artifacts_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            return ProbeOutcome {
                status: RunStatus::Fail,
                error_kind: Some("runner_protocol".to_string()),
                error_message: Some(format!("failed to create scratch artifacts dir: {e}")),
                elapsed_ms: 0,
            };
        }
    };

    let invocation: ChildInvocation = kind::build_invocation(
        crate::model::TestKind::ScriptJs,
        sandbox,
        &wrapper_path,
        &script_path,
        &domain.http_check_url,
        artifacts_dir.path(),
        domain.timeout_seconds,
    );
    let env = vec![("VIGIL_BROWSER_PATH".to_string(), sandbox.browser_executable_path.clone())];

    let child_run = match child::run(&invocation, domain.timeout_seconds, sandbox.grace_seconds, &env).await {
        Ok(run) => run,
        Err(e) => {
            return ProbeOutcome {
                status: RunStatus::Fail,
                error_kind: Some("runner_protocol".to_string()),
                error_message: Some(format!("failed to spawn browser check: {e}")),
                elapsed_ms: 0,
            };
        }
    };

    match child_run.outcome {
        child::Outcome::TimedOut => ProbeOutcome {
            status: RunStatus::Timeout,
            error_kind: Some("timeout".to_string()),
            error_message: Some(format!(
                "domain browser check exceeded {}s + {}s grace",
                domain.timeout_seconds, sandbox.grace_seconds
            )),
            elapsed_ms: 0,
        },
        child::Outcome::Exited(_) => match protocol::parse_result_line(&child_run.stdout_lines) {
            Some(payload) => {
                let mut status: RunStatus = payload.status.into();
                if status == RunStatus::Fail
                    && payload.error_message.as_deref().is_some_and(looks_like_infra_failure)
                {
                    status = RunStatus::InfraDegraded;
                    warn!(domain = %domain.name, "classified domain browser check as infra-degraded via sentinel match");
                }
                ProbeOutcome {
                    status,
                    error_kind: payload.error_kind,
                    error_message: payload.error_message,
                    elapsed_ms: 0,
                }
            }
            None => ProbeOutcome {
                status: RunStatus::Fail,
                error_kind: Some("runner_protocol".to_string()),
                error_message: Some(
                    "domain browser check exited without a parsable E2E_RESULT_JSON line".to_string(),
                ),
                elapsed_ms: 0,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_domain(url: &str, browser_check: bool) -> Domain {
        Domain {
            name: "example".to_string(),
            http_check_url: url.to_string(),
            browser_check_enabled: browser_check,
            interval_seconds: 120,
            timeout_seconds: 5,
            down_after_failures: 2,
            up_after_successes: 2,
            disabled: false,
            disabled_until_ts: None,
        }
    }

    #[tokio::test]
    async fn unreachable_host_fails_http_liveness() {
        let client = Client::new();
        let sandbox = SandboxConfig {
            browser_executable_path: "/usr/bin/chromium".to_string(),
            python_interpreter: "python3".to_string(),
            node_interpreter: "node".to_string(),
            grace_seconds: 1,
        };
        // Reserved TEST-NET-1 address (RFC 5737): never routable.
        let domain = sample_domain("http://192.0.2.1/healthz", false);
        let outcome = probe(&client, &sandbox, &domain).await;
        assert_eq!(outcome.status, RunStatus::Fail);
        assert_eq!(outcome.error_kind.as_deref(), Some("http_liveness"));
    }
}
