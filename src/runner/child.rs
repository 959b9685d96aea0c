//! Spawns and bounds a single sandbox child process.
//!
//! Output is captured line-by-line rather than streamed to a live
//! consumer (unlike the teacher's `exec_stream`) because the only
//! consumer here is the result parser and the `run.log` artifact, both of
//! which need the full transcript after the child exits.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::kind::ChildInvocation;

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("failed to spawn sandbox child: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to capture sandbox child stdout/stderr")]
    PipesNotCaptured,
    #[error("io error reading sandbox child output: {0}")]
    Io(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exited on its own within `timeout + grace`.
    Exited(i32),
    /// Still running after `timeout_seconds`; killed after `grace_seconds`.
    TimedOut,
}

pub struct ChildRun {
    pub outcome: Outcome,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

/// Runs `invocation` to completion, enforcing `timeout_seconds` followed by
/// `grace_seconds` before a hard kill. A child that is killed still has its
/// captured output returned, so a timed-out run can still be diagnosed.
pub async fn run(
    invocation: &ChildInvocation,
    timeout_seconds: i64,
    grace_seconds: u64,
    env: &[(String, String)],
) -> Result<ChildRun, ChildError> {
    let mut command = Command::new(&invocation.program);
    command.args(&invocation.args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(ChildError::Spawn)?;
    let stdout = child.stdout.take().ok_or(ChildError::PipesNotCaptured)?;
    let stderr = child.stderr.take().ok_or(ChildError::PipesNotCaptured)?;

    let stdout_task = tokio::spawn(collect_lines(stdout));
    let stderr_task = tokio::spawn(collect_lines(stderr));

    let hard_deadline = Duration::from_secs(timeout_seconds.max(0) as u64 + grace_seconds);
    let outcome = match tokio::time::timeout(hard_deadline, child.wait()).await {
        Ok(Ok(status)) => Outcome::Exited(status.code().unwrap_or(-1)),
        Ok(Err(e)) => return Err(ChildError::Io(e)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Outcome::TimedOut
        }
    };

    let stdout_lines = stdout_task.await.map_err(|_| ChildError::PipesNotCaptured)??;
    let stderr_lines = stderr_task.await.map_err(|_| ChildError::PipesNotCaptured)??;

    Ok(ChildRun {
        outcome,
        stdout_lines,
        stderr_lines,
    })
}

async fn collect_lines(pipe: impl tokio::io::AsyncRead + Unpin) -> Result<Vec<String>, ChildError> {
    let reader = BufReader::new(pipe);
    let mut lines = reader.lines();
    let mut collected = Vec::new();
    while let Some(line) = lines.next_line().await.map_err(ChildError::Io)? {
        collected.push(line);
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_invocation(text: &str) -> ChildInvocation {
        ChildInvocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), format!("echo '{text}'")],
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = run(&echo_invocation("E2E_RESULT_JSON={\"status\":\"pass\"}"), 5, 1, &[])
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Exited(0));
        assert_eq!(
            result.stdout_lines,
            vec!["E2E_RESULT_JSON={\"status\":\"pass\"}".to_string()]
        );
    }

    #[tokio::test]
    async fn hung_child_is_killed_after_grace() {
        let invocation = ChildInvocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
        };
        let result = run(&invocation, 0, 1, &[]).await.unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn env_vars_are_passed_through() {
        let invocation = ChildInvocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo \"$VIGIL_TEST_VAR\"".to_string()],
        };
        let result = run(&invocation, 5, 1, &[("VIGIL_TEST_VAR".to_string(), "hi".to_string())])
            .await
            .unwrap();
        assert_eq!(result.stdout_lines, vec!["hi".to_string()]);
    }
}
