//! Escalation dispatcher: hands a DOWN transition to an investigative
//! agent and polls until it produces a final report.
//!
//! The agent is a black box behind `create_job` / `poll`; this client only
//! knows the wire contract, not what runs on the other end.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};

use crate::config::EscalationConfig;

/// The read-only operational rules embedded verbatim in every escalation
/// prompt. The agent investigating a DOWN transition must never be able to
/// make the outage worse.
pub const READ_ONLY_RULES: &str = "\
You are investigating a reported outage. You MUST NOT:
- mutate, modify, or delete any resource on the target system
- authenticate with real credentials of any kind
- perform any write, POST, PUT, PATCH, or DELETE operation against the target
Produce only investigative observations about the likely cause.";

#[derive(Debug, Serialize)]
struct CreateJobRequest<'a> {
    prompt: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    done: bool,
    output: Option<String>,
}

pub struct EscalationOutcome {
    pub output: Option<String>,
    pub timed_out: bool,
}

pub struct EscalationClient {
    client: reqwest::Client,
    config: EscalationConfig,
}

impl EscalationClient {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Builds a prompt for `subject_description`, embedding the read-only
    /// rules ahead of the caller-supplied context.
    pub fn build_prompt(subject_description: &str, failing_run_summary: &str) -> String {
        format!(
            "{READ_ONLY_RULES}\n\nSubject: {subject_description}\nFailing run summary: {failing_run_summary}"
        )
    }

    async fn create_job(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .post(format!("{}/jobs", self.config.endpoint))
            .bearer_auth(&self.config.token)
            .json(&CreateJobRequest { prompt, model: &self.config.model })
            .send()
            .await?
            .error_for_status()?
            .json::<CreateJobResponse>()
            .await?;
        Ok(response.job_id)
    }

    async fn poll_once(&self, job_id: &str) -> anyhow::Result<PollResponse> {
        let response = self
            .client
            .get(format!("{}/jobs/{job_id}", self.config.endpoint))
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .error_for_status()?
            .json::<PollResponse>()
            .await?;
        Ok(response)
    }

    /// Creates a job for `prompt`, then polls until `done` or the
    /// configured timeout elapses.
    pub async fn run(&self, prompt: &str) -> anyhow::Result<EscalationOutcome> {
        let job_id = self.create_job(prompt).await?;
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_seconds);
        let interval = Duration::from_secs(self.config.poll_interval_seconds);

        loop {
            let poll = self.poll_once(&job_id).await?;
            if poll.done {
                return Ok(EscalationOutcome {
                    output: poll.output,
                    timed_out: false,
                });
            }
            if Instant::now() >= deadline {
                return Ok(EscalationOutcome {
                    output: None,
                    timed_out: true,
                });
            }
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_prompt_embeds_read_only_rules_verbatim() {
        let prompt = EscalationClient::build_prompt("domain:example.com", "HTTP 503 x3");
        assert!(prompt.contains(READ_ONLY_RULES));
        assert!(prompt.contains("domain:example.com"));
        assert!(prompt.contains("HTTP 503 x3"));
    }
}
