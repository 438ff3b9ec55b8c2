//! Replica configuration.

use std::time::Duration;

/// What to do with optimistic writes when a push fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushFailurePolicy {
    /// Keep local state and the queued mutations; they are re-sent with the
    /// next push.
    #[default]
    KeepPending,
    /// Undo every unconfirmed mutation, newest first, and drop it.
    Rollback,
}

/// Bounded retry with exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` means at most once.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::at_most_once()
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn at_most_once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Up to `max_attempts` attempts with the default backoff.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::at_most_once()
        }
    }

    /// Delay before attempt number `attempt` (1-based, so attempt 2 is the
    /// first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Pull gating on the notification stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateConfig {
    /// Pulls stay blocked for this long after the stream opens.
    pub warmup: Duration,
    /// `sync` messages within this window of the last pull are dropped.
    pub debounce: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(3),
            debounce: Duration::from_secs(1),
        }
    }
}

/// Endpoints and policies of one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaConfig {
    pub push_url: String,
    pub pull_url: String,
    pub poke_url: String,
    pub stream_url: String,
    pub push_failure_policy: PushFailurePolicy,
    pub poke_retry: RetryPolicy,
    pub gate: GateConfig,
    /// Wait between a stream failure and the next connection attempt.
    pub reconnect_delay: Duration,
}

impl ReplicaConfig {
    /// Derive every endpoint from the relay's base URL.
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            push_url: format!("{base}/replicache/push"),
            pull_url: format!("{base}/replicache/pull"),
            poke_url: format!("{base}/replicache/poke-user"),
            stream_url: format!("{base}/replicache/stream"),
            push_failure_policy: PushFailurePolicy::default(),
            poke_retry: RetryPolicy::default(),
            gate: GateConfig::default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Pull from a separate domain backend.
    pub fn with_pull_url(mut self, url: impl Into<String>) -> Self {
        self.pull_url = url.into();
        self
    }

    pub fn with_push_failure_policy(mut self, policy: PushFailurePolicy) -> Self {
        self.push_failure_policy = policy;
        self
    }

    pub fn with_poke_retry(mut self, retry: RetryPolicy) -> Self {
        self.poke_retry = retry;
        self
    }
}
