//! End-to-end replica behavior against an in-memory server.

use futures_util::stream::{self, StreamExt};
use protocol::{
    ClientGroupId, ClientId, ClientIdentity, PatchOperation, PokeResponse, PullRequest, PullResponse,
    PushRequest, PushResponse, StreamMessage, UserId,
};
use replica::{
    MessageStream, MutatorRegistry, PushFailurePolicy, Replica, ReplicaConfig, RetryPolicy,
    SessionIdentity, SyncState, SyncTransport, Task, TransportError,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory stand-in for the relay and the pull backend.
#[derive(Default)]
struct FakeServer {
    online: AtomicBool,
    push_down: AtomicBool,
    last_ids: Mutex<HashMap<ClientId, u64>>,
    pushes: Mutex<Vec<PushRequest>>,
    pulls: AtomicU32,
    next_patch: Mutex<Vec<PatchOperation>>,
    pokes: Mutex<Vec<UserId>>,
    poke_attempts: AtomicU32,
    failing_pokes: AtomicU32,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<StreamMessage>>>,
}

impl FakeServer {
    fn online() -> Arc<Self> {
        let server = Arc::new(Self::default());
        server.online.store(true, Ordering::SeqCst);
        server
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Request("connection refused".into()))
        }
    }

    fn queue_stream(&self) -> mpsc::UnboundedSender<StreamMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }
}

#[derive(Clone)]
struct FakeTransport(Arc<FakeServer>);

impl SyncTransport for FakeTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        self.0.check_online()?;
        if self.0.push_down.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 500,
                body: "push backend down".into(),
            });
        }
        self.0.pushes.lock().unwrap().push(request.clone());
        let mut last_ids = self.0.last_ids.lock().unwrap();
        let entry = last_ids.entry(request.client_id.clone()).or_insert(0);
        for m in &request.mutations {
            *entry = (*entry).max(m.id);
        }
        Ok(PushResponse {
            last_mutation_id: *entry,
        })
    }

    async fn pull(&self, _request: &PullRequest) -> Result<PullResponse, TransportError> {
        self.0.check_online()?;
        let n = self.0.pulls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PullResponse {
            cookie: json!(n),
            last_mutation_id_changes: self.0.last_ids.lock().unwrap().clone(),
            patch: std::mem::take(&mut *self.0.next_patch.lock().unwrap()),
        })
    }

    async fn poke_user(&self, user_id: &UserId, _token: &str) -> Result<PokeResponse, TransportError> {
        self.0.poke_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.0.failing_pokes.load(Ordering::SeqCst);
        if failing > 0 {
            self.0.failing_pokes.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.0.pokes.lock().unwrap().push(user_id.clone());
        Ok(PokeResponse {
            success: true,
            user_id: Some(user_id.to_string()),
            clients_notified: 1,
        })
    }

    async fn open_stream(
        &self,
        _user_id: Option<&UserId>,
        _token: Option<&str>,
    ) -> Result<MessageStream, TransportError> {
        let rx = self
            .0
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Request("connection refused".into()))?;
        let messages = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (Ok(m), rx)) });
        Ok(messages.boxed())
    }
}

fn replica_with(server: &Arc<FakeServer>, config: ReplicaConfig, signed_in: bool) -> Replica<FakeTransport> {
    Replica::new(
        config,
        FakeTransport(Arc::clone(server)),
        ClientIdentity::new(ClientGroupId::TODO, "profile-1"),
        MutatorRegistry::with_defaults(),
        move || {
            if signed_in {
                SessionIdentity::new("u1", "token")
            } else {
                SessionIdentity::anonymous()
            }
        },
    )
}

fn replica(server: &Arc<FakeServer>) -> Replica<FakeTransport> {
    replica_with(server, ReplicaConfig::new("http://relay.test"), true)
}

fn task(replica: &Replica<FakeTransport>, id: &str) -> Option<Task> {
    replica.store().get_as::<Task>(&format!("task/{id}")).unwrap()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_dispatch_confirms_and_pokes() {
    let server = FakeServer::online();
    let replica = replica(&server);

    let outcome = replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();

    assert_eq!(outcome.mutation_id, 1);
    assert!(outcome.confirmed);
    assert_eq!(outcome.result["title"], "Buy milk");
    assert_eq!(task(&replica, "t1").unwrap().title, "Buy milk");
    assert_eq!(replica.pending_count(), 0);
    assert_eq!(replica.last_mutation_id(), 1);

    let pushes = server.pushes.lock().unwrap().clone();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].mutations[0].name, "createTask");
    assert_eq!(pushes[0].client_group_id.as_str(), "todo-replicache-flat");

    settle().await;
    assert_eq!(*server.pokes.lock().unwrap(), vec![UserId::from("u1")]);
    assert_eq!(replica.status().snapshot().state, SyncState::Synced);
}

#[tokio::test]
async fn test_anonymous_dispatch_skips_poke() {
    let server = FakeServer::online();
    let replica = replica_with(&server, ReplicaConfig::new("http://relay.test"), false);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    settle().await;

    assert_eq!(server.poke_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mutator_error_queues_nothing() {
    let server = FakeServer::online();
    let replica = replica(&server);

    let err = replica
        .dispatch("updateTask", json!({"id": "missing", "title": "x"}))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("task/missing"));
    assert_eq!(replica.pending_count(), 0);
    assert!(server.pushes.lock().unwrap().is_empty());

    // The failed attempt does not burn an id.
    let ok = replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    assert_eq!(ok.mutation_id, 1);
}

#[tokio::test]
async fn test_offline_dispatch_keeps_optimistic_state() {
    let server = FakeServer::offline();
    let replica = replica(&server);

    let outcome = replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();

    assert!(!outcome.confirmed);
    assert!(task(&replica, "t1").is_some());
    assert_eq!(replica.pending_count(), 1);
    let snapshot = replica.status().snapshot();
    assert_eq!(snapshot.state, SyncState::Disconnected);
    assert_eq!(snapshot.failed_operations, 1);
    assert!(snapshot.last_error.is_some());

    // Local writes keep working while offline.
    replica
        .dispatch("updateTask", json!({"id": "t1", "completed": true}))
        .await
        .unwrap();
    assert!(task(&replica, "t1").unwrap().completed);
    assert_eq!(replica.pending_count(), 2);

    server.set_online(true);
    let resp = replica.flush().await.unwrap().unwrap();
    assert_eq!(resp.last_mutation_id, 2);
    assert_eq!(replica.pending_count(), 0);
    assert_eq!(replica.status().snapshot().state, SyncState::Synced);

    let pushes = server.pushes.lock().unwrap();
    let ids: Vec<u64> = pushes[0].mutations.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_rollback_policy_reverts_unconfirmed() {
    let server = FakeServer::online();
    let config = ReplicaConfig::new("http://relay.test").with_push_failure_policy(PushFailurePolicy::Rollback);
    let replica = replica_with(&server, config, true);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    server.set_online(false);

    let outcome = replica
        .dispatch("updateTask", json!({"id": "t1", "title": "Buy oat milk"}))
        .await
        .unwrap();

    assert!(!outcome.confirmed);
    assert_eq!(replica.pending_count(), 0);
    assert_eq!(task(&replica, "t1").unwrap().title, "Buy milk");
}

#[tokio::test]
async fn test_pull_rebases_pending_on_server_state() {
    let server = FakeServer::offline();
    let replica = replica(&server);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();

    server.set_online(true);
    *server.next_patch.lock().unwrap() = vec![PatchOperation::Put {
        key: "task/t2".into(),
        value: json!({"id": "t2", "title": "From another device"}),
    }];

    let summary = replica.pull().await.unwrap();
    assert_eq!(summary.patch_ops, 1);
    assert_eq!(summary.confirmed, 0);
    assert_eq!(summary.replayed, 1);
    assert!(task(&replica, "t1").is_some());
    assert_eq!(task(&replica, "t2").unwrap().title, "From another device");
    assert_eq!(replica.pending_count(), 1);
}

#[tokio::test]
async fn test_pull_drops_confirmed_and_takes_server_version() {
    let server = FakeServer::offline();
    let replica = replica(&server);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();

    let client_id = replica.client_identity().client_id;
    server.last_ids.lock().unwrap().insert(client_id, 1);
    server.set_online(true);
    *server.next_patch.lock().unwrap() = vec![
        PatchOperation::Clear,
        PatchOperation::Put {
            key: "task/t1".into(),
            value: json!({"id": "t1", "title": "Buy milk (server)"}),
        },
    ];

    let summary = replica.pull().await.unwrap();
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.replayed, 0);
    assert_eq!(replica.pending_count(), 0);
    assert_eq!(replica.last_mutation_id(), 1);
    assert_eq!(task(&replica, "t1").unwrap().title, "Buy milk (server)");
}

#[tokio::test]
async fn test_replay_failure_keeps_mutation_queued() {
    let server = FakeServer::online();
    let replica = replica(&server);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    server.set_online(false);
    replica
        .dispatch("updateTask", json!({"id": "t1", "completed": true}))
        .await
        .unwrap();

    server.set_online(true);
    *server.next_patch.lock().unwrap() = vec![PatchOperation::Del { key: "task/t1".into() }];

    let summary = replica.pull().await.unwrap();
    assert_eq!(summary.replayed, 1);
    assert!(task(&replica, "t1").is_none());
    assert_eq!(replica.pending_count(), 1);
}

#[tokio::test]
async fn test_rotate_client_renumbers_pending() {
    let server = FakeServer::offline();
    let replica = replica(&server);

    for id in ["t1", "t2"] {
        replica
            .dispatch("createTask", json!({"id": id, "title": "x"}))
            .await
            .unwrap();
    }
    let before = replica.client_identity().client_id;
    let retired = replica.rotate_client().await;

    assert_eq!(retired, before);
    assert_ne!(replica.client_identity().client_id, before);
    let ids: Vec<u64> = replica.pending_mutations().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_poke_retries_with_backoff() {
    let server = FakeServer::online();
    server.failing_pokes.store(2, Ordering::SeqCst);
    let config = ReplicaConfig::new("http://relay.test").with_poke_retry(RetryPolicy::with_attempts(3));
    let replica = replica_with(&server, config, true);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(server.poke_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(server.pokes.lock().unwrap().len(), 1);
    assert_eq!(replica.status().snapshot().failed_operations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_poke_is_recorded_not_retried() {
    let server = FakeServer::online();
    server.failing_pokes.store(1, Ordering::SeqCst);
    let replica = replica(&server);

    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(server.poke_attempts.load(Ordering::SeqCst), 1);
    let snapshot = replica.status().snapshot();
    assert_eq!(snapshot.failed_operations, 1);
    assert_eq!(snapshot.state, SyncState::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_stream_sync_triggers_pull_after_warmup() {
    let server = FakeServer::online();
    let events = server.queue_stream();
    let replica = replica(&server);
    let sync = replica.spawn_sync();

    events.send(StreamMessage::Connected).unwrap();
    events.send(StreamMessage::Sync).unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(server.pulls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(server.pulls.load(Ordering::SeqCst), 1);

    *server.next_patch.lock().unwrap() = vec![PatchOperation::Put {
        key: "task/t9".into(),
        value: json!({"id": "t9", "title": "Poked in"}),
    }];
    tokio::time::sleep(Duration::from_millis(2000)).await;
    events.send(StreamMessage::Sync).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    events.send(StreamMessage::Sync).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.pulls.load(Ordering::SeqCst), 2);
    assert_eq!(task(&replica, "t9").unwrap().title, "Poked in");
    assert_eq!(replica.status().snapshot().state, SyncState::Synced);

    sync.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_sync_pulls_when_push_fails() {
    let server = FakeServer::online();
    server.push_down.store(true, Ordering::SeqCst);
    let replica = replica(&server);
    replica
        .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
        .await
        .unwrap();
    assert_eq!(replica.pending_count(), 1);

    let events = server.queue_stream();
    let sync = replica.spawn_sync();
    *server.next_patch.lock().unwrap() = vec![PatchOperation::Put {
        key: "task/t2".into(),
        value: json!({"id": "t2", "title": "From another device"}),
    }];
    events.send(StreamMessage::Connected).unwrap();
    events.send(StreamMessage::Sync).unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(server.pulls.load(Ordering::SeqCst), 1);
    assert!(server.pushes.lock().unwrap().is_empty());
    assert_eq!(task(&replica, "t2").unwrap().title, "From another device");
    assert!(task(&replica, "t1").is_some());
    assert_eq!(replica.pending_count(), 1);

    sync.stop().await;
}
