//! Downtime detection for the monitored link.

mod supervisor;

pub use supervisor::*;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observable state of the monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Healthy,
    DownUnconfirmed,
    DownConfirmed,
}

/// What a single supervisor pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing has ever reported in
    NoHeartbeats,
    Healthy,
    DowntimeOpened(i64),
    DowntimeConfirmed(i64),
    /// An event is open and nothing changed this pass
    StillDown(i64),
}

/// Whole seconds from `from` to `to`, floored.
pub fn whole_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().div_euclid(1000)
}

/// Whole minutes in a millisecond span, floored.
pub fn whole_minutes(ms: i64) -> i64 {
    ms.div_euclid(60_000)
}
