//! Out-of-band notifications to an ops channel.
//!
//! Notification failures are never allowed to disturb scheduling: every
//! method is best-effort, logging and swallowing errors. When credentials
//! are absent the orchestrator falls back to [`NoopNotifier`].

use async_trait::async_trait;
use tracing::{debug, warn};

/// Chat-channel notification surface.
///
/// The `agent_*` helpers have default implementations in terms of
/// [`Notifier::send_message`]; implementors usually only provide transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a message, optionally as a threaded reply. Returns the message
    /// id when the transport provides one.
    async fn send_message(&self, text: &str, reply_to: Option<&str>) -> Option<String>;

    async fn agent_started(&self, task_slug: &str, title: &str) {
        self.send_message(&format!("Agent started on {task_slug}: {title}"), None)
            .await;
    }

    async fn agent_completed(&self, task_slug: &str, title: &str) {
        self.send_message(&format!("Agent completed {task_slug}: {title}"), None)
            .await;
    }

    async fn agent_errored(&self, task_slug: &str, title: &str, error: &str) {
        self.send_message(
            &format!("Agent failed on {task_slug}: {title}\n{error}"),
            None,
        )
        .await;
    }

    /// An agent is waiting on a human. Returns the message id so follow-ups
    /// can thread under it.
    async fn agent_blocked(&self, task_slug: &str, question: &str) -> Option<String> {
        self.send_message(&format!("Agent blocked on {task_slug}: {question}"), None)
            .await
    }
}

/// Notifier used when no credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_message(&self, text: &str, _reply_to: Option<&str>) -> Option<String> {
        debug!(text, "notification suppressed (no notifier configured)");
        None
    }
}

/// Slack notifier posting via `chat.postMessage`.
///
/// The returned message id is Slack's `ts`, which doubles as the thread
/// anchor for replies.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    bot_token: String,
    channel: String,
}

impl SlackNotifier {
    pub fn new(bot_token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            channel: channel.into(),
        }
    }

    /// Build a notifier from `SLACK_BOT_TOKEN` / `SLACK_CHANNEL`, when both
    /// are present.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("SLACK_BOT_TOKEN").ok()?;
        let channel = std::env::var("SLACK_CHANNEL").ok()?;
        Some(Self::new(token, channel))
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_message(&self, text: &str, reply_to: Option<&str>) -> Option<String> {
        let mut body = serde_json::json!({
            "channel": self.channel,
            "text": text,
        });
        if let Some(thread_ts) = reply_to {
            body["thread_ts"] = serde_json::Value::String(thread_ts.to_string());
        }

        let response = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to send notification");
                return None;
            }
        };

        let payload: serde_json::Value = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to decode notification response");
                return None;
            }
        };

        if payload["ok"].as_bool() != Some(true) {
            warn!(
                error = %payload["error"].as_str().unwrap_or("unknown"),
                "notification rejected"
            );
            return None;
        }

        payload["ts"].as_str().map(|ts| ts.to_string())
    }
}
