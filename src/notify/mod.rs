//! Outbound downtime notifications.
//!
//! The supervisor only knows the [`NotificationSink`] trait. Delivery is
//! fire-once: a failed send is logged and never rolls back or retries the
//! state change that triggered it.

mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Notification delivery error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Receiver of downtime lifecycle notifications.
///
/// Implementations must treat a disabled or unconfigured channel as a no-op
/// and return `Ok(())`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn downtime_detected(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        timeout_ms: u64,
    ) -> Result<(), NotifyError>;

    async fn downtime_confirmed(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        confirmation_delay_ms: u64,
    ) -> Result<(), NotifyError>;

    async fn recovered(
        &self,
        event_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), NotifyError>;
}

/// Send a "downtime detected" notification, logging failures.
pub async fn deliver_detected(
    sink: &dyn NotificationSink,
    event_id: i64,
    started_at: DateTime<Utc>,
    timeout_ms: u64,
) {
    if let Err(e) = sink.downtime_detected(event_id, started_at, timeout_ms).await {
        tracing::error!(event_id, error = %e, "Failed to deliver downtime-detected notification");
    }
}

/// Send a "downtime confirmed" notification, logging failures.
pub async fn deliver_confirmed(
    sink: &dyn NotificationSink,
    event_id: i64,
    started_at: DateTime<Utc>,
    confirmation_delay_ms: u64,
) {
    if let Err(e) = sink
        .downtime_confirmed(event_id, started_at, confirmation_delay_ms)
        .await
    {
        tracing::error!(event_id, error = %e, "Failed to deliver downtime-confirmed notification");
    }
}

/// Send a "recovered" notification, logging failures.
pub async fn deliver_recovered(
    sink: &dyn NotificationSink,
    event_id: i64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
) {
    if let Err(e) = sink.recovered(event_id, started_at, ended_at).await {
        tracing::error!(event_id, error = %e, "Failed to deliver recovery notification");
    }
}
