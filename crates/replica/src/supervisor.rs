//! Keeps the notification stream connected and turns its messages into pull
//! requests.
//!
//! Identity (user and token) is read from an [`IdentitySource`] on every
//! connection attempt, never cached, so logging in or out rebinds the
//! stream on the next reconnect. After a stream fails or ends the
//! supervisor waits `reconnect_delay` and opens a fresh one.

use crate::config::ReplicaConfig;
use crate::gate::{PullDecision, PullGate};
use crate::status::SyncStatusTracker;
use crate::transport::{MessageStream, SyncTransport};
use futures_util::StreamExt;
use protocol::UserId;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// Who the replica acts as right now.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: Option<UserId>,
    pub token: Option<String>,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: Some(token.into()),
        }
    }

    /// No user: the stream is opened anonymously.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Supplies the current identity at connection time.
pub trait IdentitySource: Send + Sync {
    fn current(&self) -> SessionIdentity;
}

impl<F> IdentitySource for F
where
    F: Fn() -> SessionIdentity + Send + Sync,
{
    fn current(&self) -> SessionIdentity {
        self()
    }
}

/// Identity that login and logout update in place.
#[derive(Clone, Default)]
pub struct SharedIdentity {
    inner: Arc<RwLock<SessionIdentity>>,
}

impl SharedIdentity {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(identity)),
        }
    }

    pub fn set(&self, identity: SessionIdentity) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    pub fn clear(&self) {
        self.set(SessionIdentity::anonymous());
    }
}

impl IdentitySource for SharedIdentity {
    fn current(&self) -> SessionIdentity {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Why a stream stopped being driven.
enum StreamEnd {
    Closed,
    Shutdown,
}

/// Reconnect loop for one replica's notification stream.
pub struct Supervisor<T> {
    transport: Arc<T>,
    identity: Arc<dyn IdentitySource>,
    status: SyncStatusTracker,
    gate: PullGate,
    reconnect_delay: Duration,
    pulls: mpsc::UnboundedSender<()>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<T: SyncTransport + 'static> Supervisor<T> {
    /// Each permitted pull is signaled on `pulls`.
    pub fn new(
        transport: Arc<T>,
        identity: Arc<dyn IdentitySource>,
        status: SyncStatusTracker,
        config: &ReplicaConfig,
        pulls: mpsc::UnboundedSender<()>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            transport,
            identity,
            status,
            gate: PullGate::new(config.gate),
            reconnect_delay: config.reconnect_delay,
            pulls,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, drive, reconnect until shutdown.
    pub async fn run(mut self) {
        loop {
            let identity = self.identity.current();
            self.gate.on_connecting();
            tracing::debug!(
                "Opening notification stream as {}",
                identity.user_id.as_ref().map(UserId::as_str).unwrap_or("anonymous")
            );

            let opened = tokio::select! {
                opened = self.transport.open_stream(identity.user_id.as_ref(), identity.token.as_deref()) => opened,
                _ = self.shutdown_rx.recv() => return,
            };

            match opened {
                Ok(stream) => {
                    self.status.connected();
                    self.gate.on_open(Instant::now());
                    if let StreamEnd::Shutdown = self.drive(stream).await {
                        return;
                    }
                }
                Err(e) => tracing::warn!("Failed to open notification stream: {}", e),
            }

            self.status.disconnected();
            self.gate.on_connecting();
            tracing::info!(
                "Notification stream down, reconnecting in {:?}",
                self.reconnect_delay
            );
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = self.shutdown_rx.recv() => return,
            }
        }
    }

    async fn drive(&mut self, mut stream: MessageStream) -> StreamEnd {
        loop {
            let deadline = self.gate.warmup_deadline();
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => match self.gate.on_message(&msg, Instant::now()) {
                        PullDecision::Pull => self.request_pull(),
                        PullDecision::Blocked => tracing::debug!("'{}' during warm-up, pull blocked", msg),
                        PullDecision::Debounced => tracing::debug!("'{}' debounced", msg),
                        PullDecision::Ignored => {}
                    },
                    Some(Err(e)) => {
                        tracing::warn!("Notification stream error: {}", e);
                        return StreamEnd::Closed;
                    }
                    None => {
                        tracing::debug!("Notification stream ended");
                        return StreamEnd::Closed;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.gate.poll_warmup(Instant::now()) {
                        self.request_pull();
                    }
                }
                _ = self.shutdown_rx.recv() => return StreamEnd::Shutdown,
            }
        }
    }

    fn request_pull(&self) {
        if self.pulls.send(()).is_err() {
            tracing::debug!("Pull requested but nobody is listening");
        }
    }
}

/// Handle for stopping a [`Supervisor`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the supervisor to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}
