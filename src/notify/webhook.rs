//! JSON webhook notification channel.

use super::{NotificationSink, NotifyError};
use crate::monitor::{whole_minutes, whole_seconds};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Payload POSTed to the webhook for every notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: &'static str,
    pub downtime_id: i64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    pub message: String,
}

impl Notification {
    pub fn detected(event_id: i64, started_at: DateTime<Utc>, timeout_ms: u64) -> Self {
        Self {
            event: "downtime_detected",
            downtime_id: event_id,
            started_at,
            ended_at: None,
            duration_secs: None,
            message: format!(
                "Connection down: no heartbeat for {} minutes (since {})",
                whole_minutes(timeout_ms as i64),
                started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        }
    }

    pub fn confirmed(
        event_id: i64,
        started_at: DateTime<Utc>,
        confirmation_delay_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let elapsed = whole_seconds(started_at, now);
        Self {
            event: "downtime_confirmed",
            downtime_id: event_id,
            started_at,
            ended_at: None,
            duration_secs: Some(elapsed),
            message: format!(
                "Downtime confirmed: connection down for {} minutes (threshold {} minutes)",
                whole_minutes(elapsed * 1000),
                whole_minutes(confirmation_delay_ms as i64)
            ),
        }
    }

    pub fn recovered(event_id: i64, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        let duration = whole_seconds(started_at, ended_at);
        Self {
            event: "recovered",
            downtime_id: event_id,
            started_at,
            ended_at: Some(ended_at),
            duration_secs: Some(duration),
            message: format!(
                "Connection restored after {} minutes of downtime",
                whole_minutes(duration * 1000)
            ),
        }
    }
}

/// Delivers notifications as JSON POSTs. Without a URL every call is a no-op.
pub struct WebhookNotifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url, client }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        let Some(url) = &self.url else {
            tracing::debug!(event = notification.event, "Webhook disabled, dropping notification");
            return Ok(());
        };

        let resp = self.client.post(url).json(&notification).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        tracing::info!(
            event = notification.event,
            downtime_id = notification.downtime_id,
            "Notification delivered"
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn downtime_detected(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        timeout_ms: u64,
    ) -> Result<(), NotifyError> {
        self.send(Notification::detected(event_id, started_at, timeout_ms))
            .await
    }

    async fn downtime_confirmed(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        confirmation_delay_ms: u64,
    ) -> Result<(), NotifyError> {
        self.send(Notification::confirmed(
            event_id,
            started_at,
            confirmation_delay_ms,
            Utc::now(),
        ))
        .await
    }

    async fn recovered(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.send(Notification::recovered(event_id, started_at, ended_at))
            .await
    }
}
