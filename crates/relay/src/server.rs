//! HTTP surface of the relay.
//!
//! Routes:
//! - `POST /replicache/push` - apply a mutation batch, return `lastMutationID`
//! - `POST /replicache/poke-user?userId=` - authenticated wake-up for one user
//! - `POST /replicache/poke[?userId=]` - unauthenticated wake-up, broadcast without `userId`
//! - `GET /replicache/stream[?userId=&token=]` - server-sent notification stream
//! - `GET /replicache/status` - registry occupancy

use crate::auth::{AuthError, TokenVerifier};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::groups::ClientGroupRouter;
use crate::notify::Dispatcher;
use crate::progress::{MemoryProgressStore, ProgressStore};
use crate::push::PushProcessor;
use crate::registry::ConnectionRegistry;
use crate::stream::notification_stream;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt};
use protocol::{PokeResponse, PushBatch, PushResponse, StatusResponse, StreamMessage, UserId};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    processor: Arc<PushProcessor>,
    dispatcher: Dispatcher,
    verifier: Option<TokenVerifier>,
    ping_interval: Duration,
    channel_capacity: usize,
    poke_on_push: bool,
}

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    token: Option<String>,
}

/// Non-empty query value as a user ID.
fn user_param(value: Option<String>) -> Option<UserId> {
    value.filter(|v| !v.trim().is_empty()).map(UserId::from)
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl AppState {
    fn authenticate(&self, token: Option<&str>) -> Result<Option<UserId>, AuthError> {
        let token = token.ok_or(AuthError::Missing)?;
        let verifier = self.verifier.as_ref().ok_or(AuthError::Disabled)?;
        match verifier.verify(token) {
            Ok(claims) => Ok(claims.user()),
            Err(e) => {
                tracing::warn!("Rejected token: {}", e);
                Err(e)
            }
        }
    }
}

async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Json<PushResponse>> {
    let batch = PushBatch::from_json(&body).map_err(|e| {
        tracing::warn!("Rejected push body: {}", e);
        e
    })?;
    let outcome = state.processor.process(&batch);

    tracing::debug!(
        "Push from {} done: last={} applied={} duplicates={} skipped={} failed={} unrouted={}",
        batch.client_id,
        outcome.last_mutation_id,
        outcome.applied,
        outcome.duplicates,
        outcome.skipped,
        outcome.failed,
        outcome.unrouted
    );

    if state.poke_on_push && outcome.applied + outcome.failed + outcome.unrouted > 0 {
        if let Some(token) = bearer_token(&headers) {
            if let Ok(Some(user_id)) = state.authenticate(Some(token)) {
                state.dispatcher.notify(&user_id, StreamMessage::Sync);
            }
        }
    }

    Ok(Json(PushResponse {
        last_mutation_id: outcome.last_mutation_id,
    }))
}

async fn poke_user(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> RelayResult<Json<PokeResponse>> {
    let token_user = state.authenticate(bearer_token(&headers))?;
    let user_id = match (user_param(query.user_id), token_user) {
        (Some(requested), Some(owner)) if requested != owner => {
            tracing::warn!("Token for {} tried to poke {}", owner, requested);
            return Err(RelayError::Forbidden);
        }
        (requested, owner) => requested
            .or(owner)
            .ok_or(RelayError::MissingParameter("userId"))?,
    };

    let notified = state.dispatcher.notify(&user_id, StreamMessage::Sync);
    Ok(Json(PokeResponse {
        success: true,
        user_id: Some(user_id.to_string()),
        clients_notified: notified,
    }))
}

async fn poke(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Json<PokeResponse> {
    let user_id = user_param(query.user_id);
    let notified = match &user_id {
        Some(user_id) => state.dispatcher.notify(user_id, StreamMessage::Sync),
        None => state.dispatcher.notify_all(StreamMessage::Sync),
    };
    Json(PokeResponse {
        success: true,
        user_id: user_id.map(|u| u.to_string()),
        clients_notified: notified,
    })
}

async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> RelayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let token = query.token.as_deref().filter(|t| !t.trim().is_empty());
    let user_id = match token {
        Some(token) => state.authenticate(Some(token))?,
        None => None,
    }
    .or(user_param(query.user_id));

    let registry = state.dispatcher.registry();
    let (guard, rx) = registry.register(user_id.clone(), state.channel_capacity);
    tracing::debug!(
        "Stream {} opened for {}",
        guard.id(),
        user_id.as_ref().map(UserId::as_str).unwrap_or("anonymous")
    );

    let events = notification_stream(guard, rx, state.ping_interval)
        .map(|msg| Ok(Event::default().data(msg.as_str())));
    Ok(Sse::new(events))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let registry = state.dispatcher.registry();
    Json(StatusResponse {
        clients: registry.client_count(),
        users: registry.user_count(),
    })
}

/// The sync relay: push endpoint, notification fan-out and SSE streams.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    processor: Arc<PushProcessor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Relay {
    /// Create a relay with an in-memory progress store and acknowledging
    /// handlers for the configured client groups.
    pub fn new(config: RelayConfig) -> Self {
        let groups = ClientGroupRouter::acknowledging(config.client_groups.clone());
        Self::with_parts(config, Arc::new(MemoryProgressStore::new()), groups)
    }

    /// Create a relay with a custom progress store and handler set.
    pub fn with_parts(
        config: RelayConfig,
        store: Arc<dyn ProgressStore>,
        groups: ClientGroupRouter,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            processor: Arc::new(PushProcessor::new(store, Arc::new(groups))),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// A dispatcher writing to this relay's registry.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.registry))
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let verifier = (!self.config.jwt_secret.is_empty())
            .then(|| TokenVerifier::new(self.config.jwt_secret.as_bytes()));
        if verifier.is_none() {
            tracing::warn!("No token secret configured; authenticated pokes will be refused");
        }

        let state = AppState {
            processor: Arc::clone(&self.processor),
            dispatcher: self.dispatcher(),
            verifier,
            ping_interval: self.config.ping_interval(),
            channel_capacity: self.config.channel_capacity,
            poke_on_push: self.config.poke_on_push,
        };

        Router::new()
            .route("/replicache/push", post(push))
            .route("/replicache/poke-user", post(poke_user))
            .route("/replicache/poke", post(poke))
            .route("/replicache/stream", get(stream))
            .route("/replicache/status", get(status))
            .with_state(state)
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Periodically evict channels that stopped reading.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let timeout = self.config.heartbeat_timeout();
        let period = self.config.reap_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.reap_stalled(timeout);
                        if reaped > 0 {
                            tracing::info!("Reaped {} stalled channel(s)", reaped);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Serve on an already bound listener until shutdown is signaled.
    pub async fn serve(&self, listener: TcpListener) -> RelayResult<()> {
        let reaper = self.spawn_reaper();
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Relay received shutdown signal");
                // Ends every open stream so graceful shutdown can complete.
                registry.clear();
            })
            .await?;

        reaper.abort();
        tracing::info!("Relay shutdown complete");
        Ok(())
    }

    /// Bind the configured address and serve.
    pub async fn run(&self) -> RelayResult<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Bind(addr.clone(), e))?;

        tracing::info!("Sync relay listening on {}", addr);
        self.serve(listener).await
    }
}

/// Handle for shutting down the relay.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the relay to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}
