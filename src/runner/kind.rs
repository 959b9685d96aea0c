//! Maps a [`TestKind`] to the interpreter and wrapper script used to
//! execute it, and the argv a sandbox child is invoked with.

use std::path::Path;

use crate::config::SandboxConfig;
use crate::model::TestKind;

/// The fully-resolved command line for a sandbox child, before
/// [`crate::runner::child`] actually spawns it.
pub struct ChildInvocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Builds the invocation for running `source_path` as `kind`, writing
/// artifacts into `artifacts_dir` and bounding itself to `timeout_seconds`.
///
/// The wrapper scripts bundled in [`crate::bundled`] accept a uniform
/// `--test-file / --base-url / --artifacts-dir / --timeout-seconds` CLI
/// surface regardless of language, so this function is the only place that
/// needs to know the two concrete kinds exist.
pub fn build_invocation(
    kind: TestKind,
    sandbox: &SandboxConfig,
    wrapper_path: &Path,
    source_path: &Path,
    base_url: &str,
    artifacts_dir: &Path,
    timeout_seconds: i64,
) -> ChildInvocation {
    let interpreter = match kind {
        TestKind::ScriptPython => &sandbox.python_interpreter,
        TestKind::ScriptJs => &sandbox.node_interpreter,
    };

    ChildInvocation {
        program: interpreter.clone(),
        args: vec![
            wrapper_path.display().to_string(),
            "--test-file".to_string(),
            source_path.display().to_string(),
            "--base-url".to_string(),
            base_url.to_string(),
            "--artifacts-dir".to_string(),
            artifacts_dir.display().to_string(),
            "--timeout-seconds".to_string(),
            timeout_seconds.to_string(),
        ],
    }
}
