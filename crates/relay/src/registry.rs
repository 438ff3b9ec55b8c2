//! Live notification channels.
//!
//! The registry keeps a flat map of every open channel plus a secondary
//! index from user to that user's channels (one user, many tabs or devices).
//! Every channel in the user index is also in the flat map, and removal
//! always clears both under the same lock.
//!
//! A channel dies in one of three ways:
//!
//! - its stream is dropped (client abort), which drops the [`ConnectionGuard`]
//! - a write finds the receiver gone, which is treated as a disconnect
//! - it stays full, or its stream stops taking frames, for longer than the
//!   heartbeat timeout and is reaped

use protocol::{StreamMessage, UserId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

/// Unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

struct Channel {
    user_id: Option<UserId>,
    tx: mpsc::Sender<StreamMessage>,
    /// Set on the first write that found the channel full.
    stalled_since: Option<Instant>,
    /// Shared with the consuming stream. `None` for channels read elsewhere.
    last_read: Option<Arc<Mutex<Instant>>>,
}

impl Channel {
    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        let idle_since = |since: Instant| now.saturating_duration_since(since) >= timeout;
        self.tx.is_closed()
            || self.stalled_since.is_some_and(idle_since)
            || self
                .last_read
                .as_ref()
                .is_some_and(|read| idle_since(*read.lock().unwrap_or_else(PoisonError::into_inner)))
    }
}

#[derive(Default)]
struct RegistryInner {
    channels: HashMap<ConnectionId, Channel>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };
        if let Some(user_id) = channel.user_id {
            if let Some(ids) = self.users.get_mut(&user_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.users.remove(&user_id);
                }
            }
        }
        true
    }

    /// Try to write to each channel, dropping the ones whose receiver is gone.
    fn deliver(&mut self, ids: Vec<ConnectionId>, message: &StreamMessage) -> usize {
        let now = Instant::now();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for id in ids {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            match channel.tx.try_send(message.clone()) {
                Ok(()) => {
                    channel.stalled_since = None;
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    channel.stalled_since.get_or_insert(now);
                    tracing::debug!("{} is not reading, dropped '{}'", id, message);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            tracing::debug!("{} closed underneath us, deregistering", id);
            self.remove(id);
        }

        delivered
    }
}

/// Registry of open notification channels.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel, optionally owned by a user.
    pub fn add_client(
        &self,
        tx: mpsc::Sender<StreamMessage>,
        user_id: Option<UserId>,
    ) -> ConnectionId {
        self.insert(tx, user_id, None)
    }

    fn insert(
        &self,
        tx: mpsc::Sender<StreamMessage>,
        user_id: Option<UserId>,
        last_read: Option<Arc<Mutex<Instant>>>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let mut inner = self.lock();
        if let Some(user_id) = &user_id {
            inner.users.entry(user_id.clone()).or_default().insert(id);
        }
        inner.channels.insert(
            id,
            Channel {
                user_id,
                tx,
                stalled_since: None,
                last_read,
            },
        );
        id
    }

    /// Create a bounded channel, register it and tie its lifetime to a guard.
    ///
    /// Registration counts as a read; the stream owning the guard reports
    /// further reads through [`ConnectionGuard::mark_read`].
    pub fn register(
        self: &Arc<Self>,
        user_id: Option<UserId>,
        capacity: usize,
    ) -> (ConnectionGuard, mpsc::Receiver<StreamMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let last_read = Arc::new(Mutex::new(Instant::now()));
        let id = self.insert(tx, user_id, Some(Arc::clone(&last_read)));
        let guard = ConnectionGuard {
            registry: Arc::clone(self),
            id,
            last_read,
        };
        (guard, rx)
    }

    /// Remove a channel from both the flat map and the user index.
    ///
    /// Returns `false` if the channel was already gone.
    pub fn remove_client(&self, id: ConnectionId) -> bool {
        self.lock().remove(id)
    }

    /// Send to every channel registered under `user_id`.
    ///
    /// Returns the number of channels the message was written to. Anonymous
    /// channels and other users' channels never receive it.
    pub fn notify_user(&self, user_id: &UserId, message: &StreamMessage) -> usize {
        let mut inner = self.lock();
        let ids: Vec<_> = inner
            .users
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        inner.deliver(ids, message)
    }

    /// Send to every open channel regardless of owner.
    pub fn notify_all(&self, message: &StreamMessage) -> usize {
        let mut inner = self.lock();
        let ids: Vec<_> = inner.channels.keys().copied().collect();
        inner.deliver(ids, message)
    }

    /// Remove channels whose receiver is gone, that have been full for
    /// longer than `timeout`, or whose stream has not taken a frame for
    /// `timeout`. Returns how many were removed.
    ///
    /// `timeout` must exceed the ping interval, or healthy idle streams are
    /// reaped between pings.
    pub fn reap_stalled(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<_> = inner
            .channels
            .iter()
            .filter(|(_, c)| c.expired(now, timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            tracing::info!("Reaping stalled channel {}", id);
            inner.remove(*id);
        }
        expired.len()
    }

    /// Drop every channel, which ends every open stream.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.channels.clear();
        inner.users.clear();
    }

    /// Number of open channels.
    pub fn client_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Number of open channels owned by `user_id`.
    pub fn user_client_count(&self, user_id: &UserId) -> usize {
        self.lock().users.get(user_id).map(HashSet::len).unwrap_or(0)
    }

    /// Number of distinct users with at least one open channel.
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    /// Whether a channel is still registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().channels.contains_key(&id)
    }
}

/// Deregisters its channel when dropped.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    last_read: Arc<Mutex<Instant>>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The stream handed a frame to its reader.
    pub fn mark_read(&self) {
        *self.last_read.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.registry.remove_client(self.id) {
            tracing::debug!("{} aborted, deregistered", self.id);
        }
    }
}
