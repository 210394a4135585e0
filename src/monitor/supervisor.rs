//! Downtime supervisor: detects heartbeat silence and drives the downtime
//! window lifecycle.
//!
//! ```text
//! HEALTHY --(silence > timeout, no open event)--> DOWN_UNCONFIRMED
//! DOWN_UNCONFIRMED --(age >= confirmation delay)--> DOWN_CONFIRMED
//! DOWN_* --("up" heartbeat)--> HEALTHY
//! ```
//!
//! The first two transitions happen on the polling loop; recovery happens
//! when a heartbeat is recorded.

use super::{LinkState, TickOutcome};
use crate::config::ServerConfig;
use crate::db::{DbError, DowntimeEvent, NewHeartbeat, Store};
use crate::notify::{deliver_confirmed, deliver_detected, NotificationSink};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Timing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub heartbeat_timeout: Duration,
    pub check_interval: Duration,
    pub confirmation_delay: Duration,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            heartbeat_timeout: cfg.heartbeat_timeout,
            check_interval: cfg.downtime_check_interval,
            confirmation_delay: cfg.downtime_confirmation_delay,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Result of recording a heartbeat.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub heartbeat_id: i64,
    /// The downtime event this heartbeat closed, if any
    pub closed: Option<DowntimeEvent>,
}

/// Background loop plus the heartbeat reconciliation path.
pub struct DowntimeSupervisor {
    store: Arc<Store>,
    notifier: Arc<dyn NotificationSink>,
    settings: SupervisorSettings,
    /// Events whose "confirmed" notification has gone out. Process-local.
    confirmed: Mutex<HashSet<i64>>,
    running: AtomicBool,
    stop: broadcast::Sender<()>,
}

impl DowntimeSupervisor {
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<dyn NotificationSink>,
        settings: SupervisorSettings,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            notifier,
            settings,
            confirmed: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            stop,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn confirmed(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.confirmed.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start the polling loop.
    ///
    /// The next pass is only scheduled once the current one has finished, so
    /// slow storage cannot make passes overlap. Returns `None` if the loop is
    /// already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("DowntimeSupervisor: already running");
            return None;
        }

        let mut stop_rx = self.stop.subscribe();
        let this = Arc::clone(self);
        let interval = self.settings.check_interval;

        Some(tokio::spawn(async move {
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                timeout_ms = this.settings.heartbeat_timeout.as_millis() as u64,
                confirmation_delay_ms = this.settings.confirmation_delay.as_millis() as u64,
                "DowntimeSupervisor started"
            );

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if !this.running.load(Ordering::SeqCst) {
                    break;
                }

                // Run the pass in its own task so a panic is contained like an error
                let pass = Arc::clone(&this);
                match tokio::spawn(async move { pass.tick_at(Utc::now()).await }).await {
                    Ok(Ok(outcome)) => {
                        tracing::debug!(?outcome, "DowntimeSupervisor: pass complete")
                    }
                    Ok(Err(e)) => tracing::error!(error = %e, "DowntimeSupervisor: pass failed"),
                    Err(e) => tracing::error!(error = %e, "DowntimeSupervisor: pass panicked"),
                }

                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
            }

            tracing::info!("DowntimeSupervisor stopped");
        }))
    }

    /// Stop the polling loop. A pass already in flight finishes, but no
    /// further pass is scheduled.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.stop.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one supervisor pass as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, DbError> {
        if let Some(event) = self.store.active_downtime()? {
            return self.check_confirmation(&event, now).await;
        }

        let Some(last) = self.store.last_heartbeat()? else {
            tracing::debug!("DowntimeSupervisor: no heartbeats recorded yet");
            return Ok(TickOutcome::NoHeartbeats);
        };

        let timeout = to_chrono(self.settings.heartbeat_timeout);
        if now - last.timestamp <= timeout {
            return Ok(TickOutcome::Healthy);
        }

        // The outage began when the timeout ran out, not when we noticed
        let started_at = last.timestamp + timeout;
        let notes = format!(
            "No heartbeat since {} (last state: {})",
            last.timestamp.to_rfc3339(),
            last.connection_state
        );

        let event = match self.store.create_downtime(started_at, &notes) {
            Ok(event) => event,
            Err(DbError::ActiveDowntimeExists) => {
                tracing::warn!("DowntimeSupervisor: downtime opened concurrently, skipping");
                return Ok(match self.store.active_downtime()? {
                    Some(event) => TickOutcome::StillDown(event.id),
                    None => TickOutcome::Healthy,
                });
            }
            Err(e) => return Err(e),
        };

        tracing::warn!(
            downtime_id = event.id,
            started_at = %event.started_at,
            last_heartbeat = %last.timestamp,
            "Downtime detected"
        );

        deliver_detected(
            self.notifier.as_ref(),
            event.id,
            event.started_at,
            self.settings.heartbeat_timeout.as_millis() as u64,
        )
        .await;

        Ok(TickOutcome::DowntimeOpened(event.id))
    }

    async fn check_confirmation(
        &self,
        event: &DowntimeEvent,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, DbError> {
        if now - event.started_at < to_chrono(self.settings.confirmation_delay) {
            return Ok(TickOutcome::StillDown(event.id));
        }

        // Claim the event before sending so the notification goes out at most once
        if !self.confirmed().insert(event.id) {
            return Ok(TickOutcome::StillDown(event.id));
        }

        // A heartbeat may have closed the event after it was read. Its cleanup
        // ran before our claim, so release the id here.
        let current = match self.store.active_downtime() {
            Ok(current) => current,
            Err(e) => {
                self.confirmed().remove(&event.id);
                return Err(e);
            }
        };
        if current.map(|e| e.id) != Some(event.id) {
            self.confirmed().remove(&event.id);
            tracing::debug!(downtime_id = event.id, "Downtime closed before confirmation");
            return Ok(TickOutcome::Healthy);
        }

        tracing::warn!(
            downtime_id = event.id,
            started_at = %event.started_at,
            "Downtime confirmed"
        );

        deliver_confirmed(
            self.notifier.as_ref(),
            event.id,
            event.started_at,
            self.settings.confirmation_delay.as_millis() as u64,
        )
        .await;

        Ok(TickOutcome::DowntimeConfirmed(event.id))
    }

    /// Persist a heartbeat and, if it reports the link as up, close the open
    /// downtime event.
    ///
    /// The caller is responsible for sending the recovery notification for
    /// [`RecordOutcome::closed`].
    pub fn record_heartbeat(
        &self,
        heartbeat: &NewHeartbeat,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, DbError> {
        let heartbeat_id = self.store.insert_heartbeat(heartbeat, now)?;
        tracing::debug!(
            heartbeat_id,
            state = %heartbeat.connection_state,
            "Heartbeat recorded"
        );

        let mut closed = None;
        if heartbeat.connection_state.is_recovered() {
            if let Some(event) = self.store.close_active_downtime(now)? {
                self.confirmed().remove(&event.id);
                tracing::info!(
                    downtime_id = event.id,
                    duration_secs = event.duration.unwrap_or_default(),
                    "Downtime ended"
                );
                closed = Some(event);
            }
        }

        Ok(RecordOutcome {
            heartbeat_id,
            closed,
        })
    }

    /// Current link state, derived from the open event and the confirmed set.
    pub fn link_state(&self) -> Result<LinkState, DbError> {
        Ok(match self.store.active_downtime()? {
            None => LinkState::Healthy,
            Some(event) if self.confirmed().contains(&event.id) => LinkState::DownConfirmed,
            Some(_) => LinkState::DownUnconfirmed,
        })
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionState, Telemetry};
    use crate::notify::testing::{RecordingSink, Sent};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    const TIMEOUT_MS: i64 = 300_000;
    const CONFIRM_MS: i64 = 1_800_000;

    struct Harness {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        sink: Arc<RecordingSink>,
        supervisor: Arc<DowntimeSupervisor>,
    }

    fn harness_with(sink: RecordingSink, check_interval: Duration) -> Harness {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let sink = Arc::new(sink);
        let settings = SupervisorSettings {
            heartbeat_timeout: Duration::from_millis(TIMEOUT_MS as u64),
            check_interval,
            confirmation_delay: Duration::from_millis(CONFIRM_MS as u64),
        };
        let supervisor = Arc::new(DowntimeSupervisor::new(store.clone(), sink.clone(), settings));
        Harness {
            _tmp: tmp,
            store,
            sink,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingSink::default(), Duration::from_millis(60_000))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ms(n: i64) -> ChronoDuration {
        ChronoDuration::milliseconds(n)
    }

    fn heartbeat(ts: DateTime<Utc>, state: &str) -> NewHeartbeat {
        NewHeartbeat {
            timestamp: ts,
            connection_state: ConnectionState::from(state),
            telemetry: Telemetry::default(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_no_heartbeats_is_noop() {
        let h = harness();
        assert_eq!(h.supervisor.tick_at(t0()).await.unwrap(), TickOutcome::NoHeartbeats);
        assert!(h.store.active_downtime().unwrap().is_none());
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_silence_up_to_timeout_is_healthy() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();

        assert_eq!(h.supervisor.tick_at(t0() + ms(60_000)).await.unwrap(), TickOutcome::Healthy);
        assert_eq!(
            h.supervisor.tick_at(t0() + ms(TIMEOUT_MS)).await.unwrap(),
            TickOutcome::Healthy
        );
        assert_eq!(h.supervisor.link_state().unwrap(), LinkState::Healthy);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_opens_downtime_once() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();

        let outcome = h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();
        let TickOutcome::DowntimeOpened(id) = outcome else {
            panic!("expected downtime to open, got {:?}", outcome);
        };

        let event = h.store.active_downtime().unwrap().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.started_at, t0() + ms(TIMEOUT_MS));
        assert!(event.is_active);
        assert_eq!(h.supervisor.link_state().unwrap(), LinkState::DownUnconfirmed);

        // Further ticks before the confirmation delay change nothing
        assert_eq!(
            h.supervisor.tick_at(t0() + ms(420_000)).await.unwrap(),
            TickOutcome::StillDown(id)
        );
        assert_eq!(h.store.recent_downtimes(10).unwrap().len(), 1);

        assert_eq!(
            h.sink.sent(),
            vec![Sent::Detected {
                event_id: id,
                started_at: t0() + ms(TIMEOUT_MS),
                timeout_ms: TIMEOUT_MS as u64,
            }]
        );
    }

    #[tokio::test]
    async fn test_confirmation_fires_at_most_once() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();
        let outcome = h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();
        let TickOutcome::DowntimeOpened(id) = outcome else {
            panic!("expected downtime to open");
        };
        let started_at = t0() + ms(TIMEOUT_MS);

        assert_eq!(
            h.supervisor.tick_at(started_at + ms(CONFIRM_MS - 1)).await.unwrap(),
            TickOutcome::StillDown(id)
        );
        assert_eq!(
            h.supervisor.tick_at(started_at + ms(CONFIRM_MS + 1)).await.unwrap(),
            TickOutcome::DowntimeConfirmed(id)
        );
        assert_eq!(h.supervisor.link_state().unwrap(), LinkState::DownConfirmed);

        for minutes in 1..=10 {
            assert_eq!(
                h.supervisor
                    .tick_at(started_at + ms(CONFIRM_MS + minutes * 60_000))
                    .await
                    .unwrap(),
                TickOutcome::StillDown(id)
            );
        }

        let confirmed: Vec<_> = h
            .sink
            .sent()
            .into_iter()
            .filter(|s| matches!(s, Sent::Confirmed { .. }))
            .collect();
        assert_eq!(
            confirmed,
            vec![Sent::Confirmed {
                event_id: id,
                started_at,
                confirmation_delay_ms: CONFIRM_MS as u64,
            }]
        );
    }

    #[tokio::test]
    async fn test_up_heartbeat_closes_downtime() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();
        let outcome = h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();
        let TickOutcome::DowntimeOpened(id) = outcome else {
            panic!("expected downtime to open");
        };
        let started_at = t0() + ms(TIMEOUT_MS);
        h.supervisor.tick_at(started_at + ms(CONFIRM_MS)).await.unwrap();

        let now = started_at + ms(CONFIRM_MS + 45_678);
        let outcome = h.supervisor.record_heartbeat(&heartbeat(now, "online"), now).unwrap();

        let closed = outcome.closed.expect("downtime should close");
        assert_eq!(closed.id, id);
        assert!(!closed.is_active);
        assert_eq!(closed.ended_at, Some(now));
        assert_eq!(closed.duration, Some((CONFIRM_MS + 45_678) / 1000));
        assert!(h.store.active_downtime().unwrap().is_none());
        assert_eq!(h.supervisor.link_state().unwrap(), LinkState::Healthy);

        // Fresh heartbeat: next pass is healthy and nothing reopens
        assert_eq!(h.supervisor.tick_at(now + ms(60_000)).await.unwrap(), TickOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_non_up_heartbeats_do_not_close_downtime() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();
        h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();

        let now = t0() + ms(400_000);
        for state in ["down", "negotiating"] {
            let outcome = h.supervisor.record_heartbeat(&heartbeat(now, state), now).unwrap();
            assert!(outcome.closed.is_none());
        }
        assert!(h.store.active_downtime().unwrap().is_some());

        // With no open event an "up" heartbeat is just recorded
        let h2 = harness();
        let outcome = h2.supervisor.record_heartbeat(&heartbeat(now, "up"), now).unwrap();
        assert!(outcome.heartbeat_id > 0);
        assert!(outcome.closed.is_none());
    }

    #[tokio::test]
    async fn test_close_racing_confirmation_leaves_no_stale_claim() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();
        h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();

        // The pass read the event, then a heartbeat closed it before the claim
        let read = h.store.active_downtime().unwrap().unwrap();
        let now = read.started_at + ms(CONFIRM_MS);
        h.supervisor.record_heartbeat(&heartbeat(now, "up"), now).unwrap();

        let outcome = h.supervisor.check_confirmation(&read, now).await.unwrap();
        assert_eq!(outcome, TickOutcome::Healthy);
        assert!(!h.supervisor.confirmed().contains(&read.id));
        assert!(!h.sink.sent().iter().any(|s| matches!(s, Sent::Confirmed { .. })));
    }

    #[test]
    fn test_concurrent_up_heartbeats_close_once() {
        let h = harness();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();

        let mut now = t0();
        for _ in 0..50 {
            now = now + ms(TIMEOUT_MS + 60_000);
            let opened = runtime.block_on(h.supervisor.tick_at(now)).unwrap();
            assert!(matches!(opened, TickOutcome::DowntimeOpened(_)));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let supervisor = h.supervisor.clone();
                    std::thread::spawn(move || {
                        supervisor.record_heartbeat(&heartbeat(now, "up"), now)
                    })
                })
                .collect();

            let closed = handles
                .into_iter()
                .map(|t| t.join().unwrap().expect("valid heartbeat must be accepted"))
                .filter(|outcome| outcome.closed.is_some())
                .count();
            assert_eq!(closed, 1);
        }
    }

    #[tokio::test]
    async fn test_at_most_one_active_event_across_sequences() {
        let h = harness();
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();

        let mut now = t0();
        for step in 0..200 {
            now = now + ms(60_000);
            h.supervisor.tick_at(now).await.unwrap();
            if step % 50 == 49 {
                h.supervisor.record_heartbeat(&heartbeat(now, "up"), now).unwrap();
            }
            let open = h
                .store
                .recent_downtimes(1_000)
                .unwrap()
                .into_iter()
                .filter(|e| e.is_active)
                .count();
            assert!(open <= 1);
        }

        for event in h.store.recent_downtimes(1_000).unwrap() {
            if let (Some(end), Some(duration)) = (event.ended_at, event.duration) {
                assert_eq!(duration, (end - event.started_at).num_milliseconds().div_euclid(1000));
            }
        }
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_transition() {
        let h = harness_with(RecordingSink::failing(), Duration::from_millis(60_000));
        h.store.insert_heartbeat(&heartbeat(t0(), "up"), t0()).unwrap();

        let outcome = h.supervisor.tick_at(t0() + ms(360_000)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::DowntimeOpened(_)));
        assert!(h.store.active_downtime().unwrap().is_some());

        let outcome = h
            .supervisor
            .tick_at(t0() + ms(TIMEOUT_MS + CONFIRM_MS))
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::DowntimeConfirmed(_)));
        assert_eq!(h.sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_detects_and_stops() {
        let h = harness_with(RecordingSink::default(), Duration::from_millis(60_000));
        let stale = Utc::now() - ms(TIMEOUT_MS + 120_000);
        h.store.insert_heartbeat(&heartbeat(stale, "up"), stale).unwrap();

        let handle = h.supervisor.start().expect("loop should start");
        assert!(h.supervisor.start().is_none());

        tokio::time::sleep(Duration::from_millis(150_000)).await;
        assert!(h.store.active_downtime().unwrap().is_some());
        assert_eq!(h.sink.sent().len(), 1);

        h.supervisor.stop();
        assert!(!h.supervisor.is_running());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit after stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_pass() {
        let h = harness();
        let stale = Utc::now() - ms(TIMEOUT_MS * 2);
        h.store.insert_heartbeat(&heartbeat(stale, "up"), stale).unwrap();

        let handle = h.supervisor.start().unwrap();
        h.supervisor.stop();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_millis(300_000)).await;
        assert!(h.store.active_downtime().unwrap().is_none());
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_pass_does_not_kill_loop() {
        let h = harness();
        let conn = rusqlite::Connection::open(h._tmp.path()).unwrap();
        conn.execute_batch("DROP TABLE heartbeats;").unwrap();

        assert!(h.supervisor.tick_at(Utc::now()).await.is_err());

        let handle = h.supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200_000)).await;
        assert!(!handle.is_finished());
        assert!(h.supervisor.is_running());

        h.supervisor.stop();
        handle.await.unwrap();
    }
}
