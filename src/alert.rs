//! Alert dispatch: the [`AlertSink`] trait and its chat-transport
//! implementation, plus the optional escalation dispatcher.
//!
//! Mirrors the teacher's `Reporter` trait in shape (an async, `Send + Sync`
//! trait receiving discrete events) but the events here are state
//! transitions and heartbeats rather than test-run progress.

pub mod chat;
pub mod escalation;

use async_trait::async_trait;

pub use chat::ChatAlertSink;
pub use escalation::EscalationClient;

use crate::model::SubjectId;
use crate::state::Transition;

/// One human-readable message destined for the alert channel.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub subject: SubjectId,
    pub transition: Transition,
    pub summary: String,
    pub detail: Option<String>,
}

/// A periodic roll-up sent regardless of whether anything transitioned.
#[derive(Debug, Clone)]
pub struct HeartbeatMessage {
    pub body: String,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_transition(&self, message: &AlertMessage) -> anyhow::Result<()>;
    async fn send_heartbeat(&self, message: &HeartbeatMessage) -> anyhow::Result<()>;

    /// Forwards an escalation agent's final report text (spec §4.5).
    /// Separate from `send_transition` because it arrives asynchronously,
    /// potentially long after the DOWN alert it was triggered by.
    async fn send_escalation_report(&self, subject: &SubjectId, report: &str) -> anyhow::Result<()>;
}

/// An `AlertSink` that discards everything. Used in tests and for dry-run
/// config validation, where no outbound network call should occur.
pub struct NullAlertSink;

#[async_trait]
impl AlertSink for NullAlertSink {
    async fn send_transition(&self, _message: &AlertMessage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_heartbeat(&self, _message: &HeartbeatMessage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_escalation_report(&self, _subject: &SubjectId, _report: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Splits `text` into chunks no longer than `max_chars`, breaking on line
/// boundaries where possible so a single log excerpt isn't split mid-line.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > max_chars {
            for piece in line.as_bytes().chunks(max_chars) {
                chunks.push(String::from_utf8_lossy(piece).to_string());
            }
            continue;
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_a_single_chunk() {
        assert_eq!(chunk_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_line_boundaries() {
        let text = format!("{}\n{}\n", "a".repeat(10), "b".repeat(10));
        let chunks = chunk_message(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("aaaaaaaaaa"));
        assert!(chunks[1].contains("bbbbbbbbbb"));
    }

    #[test]
    fn oversized_single_line_is_hard_split() {
        let text = "x".repeat(30);
        let chunks = chunk_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }
}
