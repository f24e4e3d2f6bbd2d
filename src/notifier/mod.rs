// SPDX-License-Identifier: MIT
//! Outbound alerts.
//!
//! The notifier converts state-machine transitions into Slack messages. The
//! state machine only emits a [`Transition`] when the state changes value, so
//! a sustained outage produces one alert per distinct transition, never one
//! per cycle. The [`AlertRecord`] keys on the current state and is updated
//! only after a send succeeds — a failed send leaves the record untouched so
//! the next transition naturally tries again.
//!
//! Transport failures are logged and never retried within the cycle; alerting
//! problems must not block the check loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::health::{HealthState, Transition};

const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability to post a text message to a named channel.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn post_message(&self, channel: &str, text: &str) -> Result<(), NotifyError>;
}

// ─── Slack transport ──────────────────────────────────────────────────────────

/// Posts via the Slack Web API (`chat.postMessage`) with a bot token.
pub struct SlackTransport {
    client: reqwest::Client,
    token: String,
}

impl SlackTransport {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }
}

#[async_trait]
impl NotificationTransport for SlackTransport {
    async fn post_message(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(SLACK_POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Transport(format!(
                "slack returned {}",
                resp.status()
            )));
        }

        // Slack reports API-level errors inside a 200 body.
        let body: Value = resp
            .json()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(NotifyError::Rejected(code.to_string()));
        }
        Ok(())
    }
}

// ─── Notifier ─────────────────────────────────────────────────────────────────

/// Last successfully alerted state, keyed on the current state only.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub state: HealthState,
    pub last_sent_at: DateTime<Utc>,
}

pub struct Notifier {
    transport: Arc<dyn NotificationTransport>,
    channel: String,
    datastack: String,
    record: RwLock<Option<AlertRecord>>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn NotificationTransport>,
        channel: impl Into<String>,
        datastack: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            channel: channel.into(),
            datastack: datastack.into(),
            record: RwLock::new(None),
        }
    }

    /// Alert on a state transition.
    ///
    /// Every transition is sent — the dedup key is the *current* state, so
    /// flapping between Degraded and Down alerts on each distinct change
    /// while repeated identical results (which emit no transition) never
    /// re-alert. The record is updated only once the send completes, so a
    /// transport failure is retried naturally on the next transition.
    pub async fn notify(&self, transition: &Transition) {
        let text = format_alert(&self.datastack, transition);
        match self.transport.post_message(&self.channel, &text).await {
            Ok(()) => {
                debug!(to = %transition.to, channel = %self.channel, "alert sent");
                *self.record.write().await = Some(AlertRecord {
                    state: transition.to,
                    last_sent_at: Utc::now(),
                });
            }
            Err(e) => {
                warn!(
                    to = %transition.to,
                    channel = %self.channel,
                    err = %e,
                    "alert delivery failed — will retry on next transition"
                );
            }
        }
    }

    /// Last successfully alerted state, if any.
    pub async fn last_alerted(&self) -> Option<AlertRecord> {
        self.record.read().await.clone()
    }
}

fn format_alert(datastack: &str, t: &Transition) -> String {
    let emoji = match t.to {
        HealthState::Healthy => ":large_green_circle:",
        HealthState::Degraded => ":warning:",
        HealthState::Down => ":red_circle:",
    };
    format!(
        "{emoji} canary [{datastack}]: {} → {} at {}\n{}",
        t.from,
        t.to,
        t.at.to_rfc3339(),
        t.reason
    )
}
