//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status reported by the appliance.
///
/// The sender's vocabulary is not under our control, so a few well-known
/// spellings are recognized and everything else is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionState {
    Up,
    Down,
    Other(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Up => "up",
            ConnectionState::Down => "down",
            ConnectionState::Other(raw) => raw,
        }
    }

    /// Whether a heartbeat in this state closes an open downtime window.
    pub fn is_recovered(&self) -> bool {
        matches!(self, ConnectionState::Up)
    }
}

impl From<&str> for ConnectionState {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" | "online" | "connected" => ConnectionState::Up,
            "down" | "offline" | "disconnected" => ConnectionState::Down,
            _ => ConnectionState::Other(raw.to_string()),
        }
    }
}

impl From<String> for ConnectionState {
    fn from(raw: String) -> Self {
        ConnectionState::from(raw.as_str())
    }
}

impl From<ConnectionState> for String {
    fn from(state: ConnectionState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional link telemetry attached to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    /// Downstream link rate in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_rate: Option<i64>,
    /// Upstream link rate in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<i64>,
}

/// A heartbeat as accepted from the appliance, before it is persisted.
#[derive(Debug, Clone)]
pub struct NewHeartbeat {
    /// Caller-supplied "as of" time
    pub timestamp: DateTime<Utc>,
    pub connection_state: ConnectionState,
    pub telemetry: Telemetry,
    pub metadata: serde_json::Value,
}

/// A stored heartbeat. Never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub connection_state: ConnectionState,
    #[serde(flatten)]
    pub telemetry: Telemetry,
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// One observed outage window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DowntimeEvent {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and end, set on close
    pub duration: Option<i64>,
    pub is_active: bool,
    pub notes: String,
}
