//! Sync health for UI consumption.
//!
//! The tracker is updated by the notification stream (connected,
//! disconnected) and by wrapping every network round-trip in
//! [`start`](SyncStatusTracker::start) / [`complete`](SyncStatusTracker::complete)
//! / [`fail`](SyncStatusTracker::fail). UIs read a [`SyncSnapshot`] or
//! [`subscribe`](SyncStatusTracker::subscribe) to changes.
//!
//! A [`track`](SyncStatusTracker::track)ed round-trip that is dropped before
//! it finishes counts as failed, so `pending_operations` never leaks.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Coarse sync state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing in flight, last round-trip succeeded.
    Synced,
    /// A round-trip is in flight.
    Syncing,
    /// The last round-trip failed or the notification stream is down.
    #[default]
    Disconnected,
}

/// Point-in-time view of sync health.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub state: SyncState,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_failed_sync: Option<DateTime<Utc>>,
    /// Round-trips started but not finished.
    pub pending_operations: usize,
    /// Round-trips that failed since the tracker was created.
    pub failed_operations: usize,
    pub last_error: Option<String>,
}

impl SyncSnapshot {
    /// Short badge text.
    pub fn label(&self) -> String {
        match self.state {
            SyncState::Synced => "Synced".to_string(),
            SyncState::Syncing if self.pending_operations > 1 => {
                format!("Syncing ({} pending)", self.pending_operations)
            }
            SyncState::Syncing => "Syncing...".to_string(),
            SyncState::Disconnected => "Offline".to_string(),
        }
    }

    /// Seconds since the last successful sync, as of `now`.
    pub fn seconds_since_sync(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_successful_sync
            .map(|t| (now - t).num_seconds().max(0))
    }
}

/// Shared, cloneable sync status tracker.
#[derive(Clone)]
pub struct SyncStatusTracker {
    tx: Arc<watch::Sender<SyncSnapshot>>,
}

impl Default for SyncStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.tx.borrow().clone()
    }

    /// Receive every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.tx.subscribe()
    }

    /// A round-trip started.
    pub fn start(&self) {
        self.tx.send_modify(|s| {
            s.pending_operations += 1;
            s.state = SyncState::Syncing;
        });
    }

    /// A round-trip succeeded.
    pub fn complete(&self) {
        self.tx.send_modify(|s| {
            s.pending_operations = s.pending_operations.saturating_sub(1);
            s.last_successful_sync = Some(Utc::now());
            s.last_error = None;
            if s.pending_operations == 0 {
                s.state = SyncState::Synced;
            }
        });
    }

    /// A round-trip failed.
    pub fn fail(&self, error: impl Display) {
        let error = error.to_string();
        self.tx.send_modify(|s| {
            s.pending_operations = s.pending_operations.saturating_sub(1);
            s.failed_operations += 1;
            s.last_failed_sync = Some(Utc::now());
            s.last_error = Some(error);
            s.state = SyncState::Disconnected;
        });
    }

    /// A best-effort operation failed without affecting connectivity.
    pub fn record_failure(&self, error: impl Display) {
        let error = error.to_string();
        self.tx.send_modify(|s| {
            s.failed_operations += 1;
            s.last_failed_sync = Some(Utc::now());
            s.last_error = Some(error);
        });
    }

    /// The notification stream opened.
    pub fn connected(&self) {
        self.tx.send_modify(|s| {
            s.state = if s.pending_operations == 0 {
                SyncState::Synced
            } else {
                SyncState::Syncing
            };
        });
    }

    /// The notification stream dropped.
    pub fn disconnected(&self) {
        self.tx.send_modify(|s| s.state = SyncState::Disconnected);
    }

    /// Wrap a round-trip with start/complete/fail.
    pub async fn track<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut in_flight = InFlight::start(self);
        let result = fut.await;
        in_flight.finished = true;
        match &result {
            Ok(_) => self.complete(),
            Err(e) => self.fail(e),
        }
        result
    }
}

/// Settles a tracked round-trip whose future was dropped mid-flight.
struct InFlight<'a> {
    tracker: &'a SyncStatusTracker,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(tracker: &'a SyncStatusTracker) -> Self {
        tracker.start();
        Self {
            tracker,
            finished: false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.fail("round-trip cancelled");
        }
    }
}
