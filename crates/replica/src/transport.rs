//! Network boundary of a replica.
//!
//! [`SyncTransport`] is the seam between sync logic and HTTP. The
//! [`HttpTransport`] implementation talks to a relay with reqwest. Tests
//! substitute an in-memory implementation.

use crate::config::ReplicaConfig;
use crate::error::TransportError;
use crate::sse::EventStreamDecoder;
use futures_util::stream::{self, BoxStream, StreamExt};
use protocol::{PokeResponse, PullRequest, PullResponse, PushRequest, PushResponse, StreamMessage, UserId};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

/// Messages from an open notification stream.
pub type MessageStream = BoxStream<'static, Result<StreamMessage, TransportError>>;

/// Transport used by a replica to reach the relay and the pull backend.
#[trait_variant::make(Send)]
pub trait SyncTransport: Send + Sync {
    /// Submit pending mutations.
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError>;

    /// Fetch authoritative state since the request cookie.
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError>;

    /// Ask the relay to wake up every stream of `user_id`.
    async fn poke_user(&self, user_id: &UserId, token: &str) -> Result<PokeResponse, TransportError>;

    /// Open the notification stream, tagged with the given identity.
    async fn open_stream(
        &self,
        user_id: Option<&UserId>,
        token: Option<&str>,
    ) -> Result<MessageStream, TransportError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    push_url: String,
    pull_url: String,
    poke_url: String,
    stream_url: String,
}

impl HttpTransport {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &ReplicaConfig) -> Self {
        Self {
            client,
            push_url: config.push_url.clone(),
            pull_url: config.pull_url.clone(),
            poke_url: config.poke_url.clone(),
            stream_url: config.stream_url.clone(),
        }
    }
}

/// Map non-2xx responses to [`TransportError::Status`].
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
    let resp = check(resp).await?;
    resp.json().await.map_err(|e| TransportError::Decode(e.to_string()))
}

impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        let resp = self.client.post(&self.push_url).json(request).send().await?;
        json(resp).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        let resp = self.client.post(&self.pull_url).json(request).send().await?;
        json(resp).await
    }

    async fn poke_user(&self, user_id: &UserId, token: &str) -> Result<PokeResponse, TransportError> {
        let resp = self
            .client
            .post(&self.poke_url)
            .query(&[("userId", user_id.as_str())])
            .bearer_auth(token)
            .send()
            .await?;
        json(resp).await
    }

    async fn open_stream(
        &self,
        user_id: Option<&UserId>,
        token: Option<&str>,
    ) -> Result<MessageStream, TransportError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(user_id) = user_id {
            query.push(("userId", user_id.as_str()));
        }
        if let Some(token) = token {
            query.push(("token", token));
        }

        let resp = self
            .client
            .get(&self.stream_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&query)
            .send()
            .await?;
        let resp = check(resp).await?;

        let bytes = Box::pin(resp.bytes_stream());
        let messages = stream::unfold(
            (bytes, EventStreamDecoder::new(), VecDeque::new()),
            |(mut bytes, mut decoder, mut queue)| async move {
                loop {
                    if let Some(msg) = queue.pop_front() {
                        return Some((Ok(msg), (bytes, decoder, queue)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => match decoder.feed(&chunk) {
                            Ok(messages) => queue.extend(messages),
                            Err(e) => return Some((Err(e), (bytes, decoder, queue))),
                        },
                        Some(Err(e)) => {
                            let err = TransportError::Stream(e.to_string());
                            return Some((Err(err), (bytes, decoder, queue)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(messages.boxed())
    }
}
