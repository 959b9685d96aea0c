//! Chunked chat-transport [`AlertSink`], backed by a single outbound
//! webhook endpoint (compatible with Slack/Discord/Mattermost-style
//! `{"text": "..."}` webhooks).

use async_trait::async_trait;
use serde::Serialize;

use super::{AlertMessage, AlertSink, HeartbeatMessage, chunk_message};
use crate::config::AlertTransportConfig;

pub struct ChatAlertSink {
    client: reqwest::Client,
    config: AlertTransportConfig,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    text: &'a str,
}

impl ChatAlertSink {
    pub fn new(config: AlertTransportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post_chunked(&self, text: &str) -> anyhow::Result<()> {
        for chunk in chunk_message(text, self.config.chunk_max_chars) {
            self.post_once(&chunk).await?;
        }
        Ok(())
    }

    /// Sends a single chunk, retrying once on transport failure (not on a
    /// non-2xx response, which usually indicates a bad payload rather than
    /// a flaky network).
    async fn post_once(&self, text: &str) -> anyhow::Result<()> {
        let attempt = |sink: &Self, text: &str| {
            sink.client
                .post(&sink.config.api_base_url)
                .bearer_auth(&sink.config.api_token)
                .json(&WebhookBody { text })
                .send()
        };

        let response = match attempt(self, text).await {
            Ok(resp) => resp,
            Err(_) => attempt(self, text).await?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat alert transport returned {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl AlertSink for ChatAlertSink {
    async fn send_transition(&self, message: &AlertMessage) -> anyhow::Result<()> {
        let mut text = format!("[{:?}] {}: {}", message.transition, message.subject, message.summary);
        if let Some(detail) = &message.detail {
            text.push('\n');
            text.push_str(detail);
        }
        self.post_chunked(&text).await
    }

    async fn send_heartbeat(&self, message: &HeartbeatMessage) -> anyhow::Result<()> {
        self.post_chunked(&message.body).await
    }

    async fn send_escalation_report(&self, subject: &crate::model::SubjectId, report: &str) -> anyhow::Result<()> {
        let text = format!("escalation report for {subject}:\n{report}");
        self.post_chunked(&text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_body_serializes_as_text_field() {
        let body = WebhookBody { text: "hello" };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"text":"hello"}"#);
    }
}
