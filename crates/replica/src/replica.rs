//! The client replica: optimistic dispatch, push confirmation and pull
//! reconciliation.
//!
//! A dispatched mutation runs against the local store before anything
//! touches the network, so local writes never wait on connectivity. The
//! mutation is then queued and pushed. Pushes and pulls are serialized per
//! replica so confirmation and rebasing never interleave.

use crate::config::{PushFailurePolicy, ReplicaConfig, RetryPolicy};
use crate::error::{MutatorError, ReplicaResult};
use crate::mutators::{MutationContext, MutatorRegistry};
use crate::pending::{PendingMutation, PendingQueue};
use crate::status::SyncStatusTracker;
use crate::store::{LocalStore, UndoLog};
use crate::supervisor::{IdentitySource, ShutdownHandle, Supervisor};
use crate::transport::SyncTransport;
use chrono::Utc;
use protocol::{
    ClientId, ClientIdentity, Mutation, PullRequest, PullResponse, PushRequest, PushResponse, UserId,
    PULL_VERSION,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of [`Replica::dispatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatched {
    pub mutation_id: u64,
    /// Whatever the mutator returned.
    pub result: Value,
    /// The server acknowledged this mutation during the dispatch.
    pub confirmed: bool,
}

/// Outcome of [`Replica::pull`].
#[derive(Clone, Debug, PartialEq)]
pub struct PullSummary {
    pub patch_ops: usize,
    /// Pending mutations the pull confirmed and dropped.
    pub confirmed: usize,
    /// Pending mutations replayed on top of the new state.
    pub replayed: usize,
}

struct DispatchState {
    identity: ClientIdentity,
    pending: PendingQueue,
    cookie: Value,
}

struct Inner<T> {
    config: ReplicaConfig,
    transport: Arc<T>,
    store: LocalStore,
    mutators: MutatorRegistry,
    state: Mutex<DispatchState>,
    /// Serializes pushes, pulls and client rotation.
    sync_lock: tokio::sync::Mutex<()>,
    status: SyncStatusTracker,
    identity: Arc<dyn IdentitySource>,
}

/// Handle to one local replica. Cheap to clone.
pub struct Replica<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Replica<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncTransport + 'static> Replica<T> {
    pub fn new(
        config: ReplicaConfig,
        transport: T,
        client: ClientIdentity,
        mutators: MutatorRegistry,
        identity: impl IdentitySource + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
                store: LocalStore::new(),
                mutators,
                state: Mutex::new(DispatchState {
                    identity: client,
                    pending: PendingQueue::new(),
                    cookie: Value::Null,
                }),
                sync_lock: tokio::sync::Mutex::new(()),
                status: SyncStatusTracker::new(),
                identity: Arc::new(identity),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn status(&self) -> &SyncStatusTracker {
        &self.inner.status
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.inner.config
    }

    pub fn client_identity(&self) -> ClientIdentity {
        self.lock_state().identity.clone()
    }

    /// Mutations applied locally but not yet confirmed.
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Snapshot of the unconfirmed mutations, oldest first.
    pub fn pending_mutations(&self) -> Vec<Mutation> {
        self.lock_state().pending.mutations()
    }

    /// Highest mutation id the server has acknowledged for this client.
    pub fn last_mutation_id(&self) -> u64 {
        self.lock_state().pending.confirmed()
    }

    /// Apply `name` locally, queue it and push.
    ///
    /// A mutator error is returned and nothing is queued. A push failure is
    /// not an error: the local write stands (or is rolled back under
    /// [`PushFailurePolicy::Rollback`]) and the sync status records it.
    pub async fn dispatch(&self, name: &str, args: Value) -> ReplicaResult<Dispatched> {
        let (mutation_id, result) = self.apply_local(name, args)?;

        let confirmed = match self.push_pending().await {
            Ok(Some(_)) => {
                self.spawn_poke();
                self.last_mutation_id() >= mutation_id
            }
            Ok(None) => self.last_mutation_id() >= mutation_id,
            Err(e) => {
                tracing::warn!("Push of mutation {} ({}) failed: {}", mutation_id, name, e);
                self.on_push_failure();
                false
            }
        };

        Ok(Dispatched {
            mutation_id,
            result,
            confirmed,
        })
    }

    /// Run the mutator against local state and enqueue it. Never suspends.
    fn apply_local(&self, name: &str, args: Value) -> Result<(u64, Value), MutatorError> {
        let mut state = self.lock_state();
        let ctx = MutationContext {
            mutation_id: state.pending.peek_mutation_id(),
            timestamp: Utc::now().timestamp_millis(),
        };

        let store = &self.inner.store;
        let mut tx = store.transaction();
        let result = self.inner.mutators.run(name, &mut tx, &args, &ctx)?;
        let undo = store.commit(tx);

        let id = state.pending.next_mutation_id();
        state.pending.push(PendingMutation {
            mutation: Mutation::new(id, name, args, ctx.timestamp),
            undo,
        });
        tracing::debug!("Applied {} locally as mutation {}", name, id);
        Ok((id, result))
    }

    /// Push every pending mutation. On failure the push-failure policy
    /// applies and the error is returned.
    pub async fn flush(&self) -> ReplicaResult<Option<PushResponse>> {
        match self.push_pending().await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.on_push_failure();
                Err(e)
            }
        }
    }

    async fn push_pending(&self) -> ReplicaResult<Option<PushResponse>> {
        let _sync = self.inner.sync_lock.lock().await;
        let request = {
            let state = self.lock_state();
            if state.pending.is_empty() {
                return Ok(None);
            }
            PushRequest {
                client_id: state.identity.client_id.clone(),
                client_group_id: state.identity.client_group_id.clone(),
                profile_id: state.identity.profile_id.clone(),
                cookie: state.cookie.clone(),
                mutations: state.pending.mutations(),
            }
        };

        tracing::debug!(
            "Pushing {} mutations for {}",
            request.mutations.len(),
            request.client_id
        );
        let response = self
            .inner
            .status
            .track(self.inner.transport.push(&request))
            .await?;
        let dropped = self.lock_state().pending.confirm(response.last_mutation_id);
        tracing::debug!(
            "Server confirmed up to {} ({} dropped from queue)",
            response.last_mutation_id,
            dropped
        );
        Ok(Some(response))
    }

    fn on_push_failure(&self) {
        match self.inner.config.push_failure_policy {
            PushFailurePolicy::KeepPending => {
                tracing::debug!("Keeping {} mutations queued for the next push", self.pending_count());
            }
            PushFailurePolicy::Rollback => {
                let mut state = self.lock_state();
                let dropped = state.pending.drain_newest_first();
                for pending in &dropped {
                    self.inner.store.revert(&pending.undo);
                }
                tracing::warn!("Rolled back {} unconfirmed mutations", dropped.len());
            }
        }
    }

    /// Wake up this user's other clients in the background.
    fn spawn_poke(&self) {
        let identity = self.inner.identity.current();
        let (Some(user_id), Some(token)) = (identity.user_id, identity.token) else {
            tracing::debug!("No signed-in user, skipping poke");
            return;
        };

        let transport = Arc::clone(&self.inner.transport);
        let status = self.inner.status.clone();
        let retry = self.inner.config.poke_retry;
        tokio::spawn(async move {
            poke_with_retry(&*transport, &user_id, &token, retry, &status).await;
        });
    }

    /// Fetch authoritative state and rebase pending mutations on top of it.
    pub async fn pull(&self) -> ReplicaResult<PullSummary> {
        let _sync = self.inner.sync_lock.lock().await;
        let request = {
            let state = self.lock_state();
            PullRequest {
                client_id: state.identity.client_id.clone(),
                client_group_id: state.identity.client_group_id.clone(),
                profile_id: state.identity.profile_id.clone(),
                cookie: state.cookie.clone(),
                pull_version: PULL_VERSION,
            }
        };

        let response = self
            .inner
            .status
            .track(self.inner.transport.pull(&request))
            .await?;
        let summary = self.rebase(response);
        tracing::debug!(
            "Pulled {} patch ops, {} confirmed, {} replayed",
            summary.patch_ops,
            summary.confirmed,
            summary.replayed
        );
        Ok(summary)
    }

    /// Revert pending writes newest first, apply the patch, drop what the
    /// server confirmed and replay the rest oldest first.
    fn rebase(&self, response: PullResponse) -> PullSummary {
        let mut state = self.lock_state();
        let store = &self.inner.store;
        let watermark = response
            .last_mutation_id_changes
            .get(&state.identity.client_id)
            .copied();

        let pending = state.pending.drain_newest_first();
        for entry in &pending {
            store.revert(&entry.undo);
        }
        store.apply_patch(&response.patch);

        let mut confirmed = 0;
        let mut replayed = 0;
        for mut entry in pending.into_iter().rev() {
            if watermark.is_some_and(|w| entry.mutation.id <= w) {
                confirmed += 1;
                continue;
            }
            let ctx = MutationContext {
                mutation_id: entry.mutation.id,
                timestamp: entry.mutation.timestamp,
            };
            let mut tx = store.transaction();
            entry.undo = match self
                .inner
                .mutators
                .run(&entry.mutation.name, &mut tx, &entry.mutation.args, &ctx)
            {
                Ok(_) => store.commit(tx),
                Err(e) => {
                    // Still pushed; the server decides what it means now.
                    tracing::warn!(
                        "Replay of mutation {} ({}) failed: {}",
                        entry.mutation.id,
                        entry.mutation.name,
                        e
                    );
                    UndoLog::default()
                }
            };
            state.pending.push(entry);
            replayed += 1;
        }

        if let Some(watermark) = watermark {
            state.pending.confirm(watermark);
        }
        state.cookie = response.cookie;

        PullSummary {
            patch_ops: response.patch.len(),
            confirmed,
            replayed,
        }
    }

    /// Push whatever is pending, then pull.
    pub async fn sync(&self) -> ReplicaResult<PullSummary> {
        self.flush().await?;
        self.pull().await
    }

    /// Switch to a fresh client ID. Pending mutations are renumbered from 1
    /// under the new ID. Returns the retired ID.
    pub async fn rotate_client(&self) -> ClientId {
        let _sync = self.inner.sync_lock.lock().await;
        let mut state = self.lock_state();
        let retired = state.identity.rotate();
        state.pending.renumber();
        tracing::info!(
            "Rotated client {} -> {} ({} pending renumbered)",
            retired,
            state.identity.client_id,
            state.pending.len()
        );
        retired
    }

    /// Keep the notification stream connected and pull whenever the gate
    /// allows it.
    pub fn spawn_sync(&self) -> SyncHandle {
        let (pulls_tx, mut pulls_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.identity),
            self.inner.status.clone(),
            &self.inner.config,
            pulls_tx,
        );
        let shutdown = supervisor.shutdown_handle();
        let stream_task = supervisor.spawn();

        let replica = self.clone();
        let pull_task = tokio::spawn(async move {
            while pulls_rx.recv().await.is_some() {
                // Requests queued behind a running pull collapse into one.
                while pulls_rx.try_recv().is_ok() {}
                // A poke means the server moved; pull even when the push did not go through.
                if let Err(e) = replica.flush().await {
                    tracing::warn!("Push before pull failed: {}", e);
                }
                if let Err(e) = replica.pull().await {
                    tracing::warn!("Pull failed: {}", e);
                }
            }
        });

        SyncHandle {
            shutdown,
            stream_task,
            pull_task,
        }
    }
}

async fn poke_with_retry<T: SyncTransport>(
    transport: &T,
    user_id: &UserId,
    token: &str,
    retry: RetryPolicy,
    status: &SyncStatusTracker,
) {
    let mut attempt = 1;
    loop {
        match transport.poke_user(user_id, token).await {
            Ok(resp) => {
                tracing::debug!("Poked {} ({} clients notified)", user_id, resp.clients_notified);
                return;
            }
            Err(e) if attempt < retry.max_attempts => {
                attempt += 1;
                let delay = retry.backoff(attempt);
                tracing::debug!("Poke for {} failed: {}, retrying in {:?}", user_id, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!("Poke for {} failed after {} attempts: {}", user_id, attempt, e);
                status.record_failure(e);
                return;
            }
        }
    }
}

/// Background sync tasks started by [`Replica::spawn_sync`].
pub struct SyncHandle {
    shutdown: ShutdownHandle,
    stream_task: JoinHandle<()>,
    pull_task: JoinHandle<()>,
}

impl SyncHandle {
    /// Close the stream and wait for both tasks to finish.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        if let Err(e) = self.stream_task.await {
            tracing::warn!("Stream task ended abnormally: {}", e);
        }
        if let Err(e) = self.pull_task.await {
            tracing::warn!("Pull task ended abnormally: {}", e);
        }
    }
}
