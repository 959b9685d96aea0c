//! The sandbox child execution contract.
//!
//! A sandbox child is expected to write exactly one line to stdout of the
//! form `E2E_RESULT_JSON=<json>` before exiting; everything else on stdout
//! and stderr is treated as log output and stored verbatim as `run.log`.
//! A child that exits without emitting the marker line is infrastructure
//! failure, not a failing test.

use serde::Deserialize;

use crate::model::RunStatus;

pub const RESULT_MARKER: &str = "E2E_RESULT_JSON=";

/// The JSON payload a sandbox child reports after the marker.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultPayload {
    pub status: ReportedStatus,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    /// The child's own sentinel classification (spec §4.4 step 4). The
    /// Runner Pool additionally re-checks `error_message` itself (§4.3 step
    /// 6) rather than trusting this blindly.
    #[serde(default)]
    pub browser_infra_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Pass,
    Fail,
    InfraDegraded,
}

impl From<ReportedStatus> for RunStatus {
    fn from(s: ReportedStatus) -> Self {
        match s {
            ReportedStatus::Pass => RunStatus::Pass,
            ReportedStatus::Fail => RunStatus::Fail,
            ReportedStatus::InfraDegraded => RunStatus::InfraDegraded,
        }
    }
}

/// Scans collected stdout lines for the result marker, returning the
/// parsed payload for the *last* occurrence (a child should only emit one,
/// but favoring the last makes accidental double-emission harmless).
pub fn parse_result_line(stdout_lines: &[String]) -> Option<ResultPayload> {
    stdout_lines
        .iter()
        .rev()
        .find_map(|line| line.strip_prefix(RESULT_MARKER))
        .and_then(|json| serde_json::from_str(json).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_pass_line() {
        let lines = vec![
            "starting test".to_string(),
            r#"E2E_RESULT_JSON={"status":"pass","final_url":"https://x.test/done"}"#.to_string(),
        ];
        let payload = parse_result_line(&lines).expect("should parse");
        assert_eq!(payload.status, ReportedStatus::Pass);
        assert_eq!(payload.final_url.as_deref(), Some("https://x.test/done"));
    }

    #[test]
    fn parses_fail_with_error_detail() {
        let lines = vec![
            r#"E2E_RESULT_JSON={"status":"fail","error_kind":"assertion","error_message":"button not found"}"#
                .to_string(),
        ];
        let payload = parse_result_line(&lines).expect("should parse");
        assert_eq!(payload.status, ReportedStatus::Fail);
        assert_eq!(payload.error_kind.as_deref(), Some("assertion"));
    }

    #[test]
    fn no_marker_line_returns_none() {
        let lines = vec!["just some output".to_string(), "more output".to_string()];
        assert!(parse_result_line(&lines).is_none());
    }

    #[test]
    fn malformed_json_after_marker_returns_none() {
        let lines = vec!["E2E_RESULT_JSON=not json".to_string()];
        assert!(parse_result_line(&lines).is_none());
    }

    #[test]
    fn parses_infra_degraded_status() {
        let lines = vec![
            r#"E2E_RESULT_JSON={"status":"infra_degraded","error_kind":"browser_infra","error_message":"target closed","browser_infra_error":true}"#
                .to_string(),
        ];
        let payload = parse_result_line(&lines).expect("should parse");
        assert_eq!(payload.status, ReportedStatus::InfraDegraded);
        assert!(payload.browser_infra_error);
        assert_eq!(RunStatus::from(payload.status), RunStatus::InfraDegraded);
    }

    #[test]
    fn last_marker_wins_on_duplicate_emission() {
        let lines = vec![
            r#"E2E_RESULT_JSON={"status":"pass"}"#.to_string(),
            r#"E2E_RESULT_JSON={"status":"fail","error_kind":"duplicate"}"#.to_string(),
        ];
        let payload = parse_result_line(&lines).expect("should parse");
        assert_eq!(payload.status, ReportedStatus::Fail);
    }
}
