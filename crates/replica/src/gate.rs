//! Decides when stream messages may trigger a pull.
//!
//! Phases per connection:
//!
//! ```text
//! Connecting --open--> WarmingUp --warm-up elapsed--> Open
//!      ^                                                |
//!      +------------------- closed / error -------------+
//! ```
//!
//! While connecting or warming up, `sync` messages are accepted but pulls are
//! blocked so a pull cannot race the replica's own start-up. When warm-up
//! ends one pull fires immediately. Afterwards each `sync` triggers a pull
//! unless one was triggered within the debounce window; the first message of
//! a window wins and later ones are dropped. Control messages never pull.
//!
//! The gate is pure state: callers pass in the current instant.

use crate::config::GateConfig;
use protocol::StreamMessage;
use tokio::time::Instant;

/// Connection phase as seen by the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatePhase {
    Connecting,
    WarmingUp { until: Instant },
    Open,
}

/// What to do with one stream message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullDecision {
    /// Trigger a pull now.
    Pull,
    /// `sync` arrived before warm-up finished.
    Blocked,
    /// `sync` arrived within the debounce window.
    Debounced,
    /// Not a `sync` message.
    Ignored,
}

/// Per-connection pull gate.
#[derive(Debug)]
pub struct PullGate {
    config: GateConfig,
    phase: GatePhase,
    last_pull: Option<Instant>,
}

impl PullGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            phase: GatePhase::Connecting,
            last_pull: None,
        }
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    /// A new connection attempt started, or the previous one closed.
    pub fn on_connecting(&mut self) {
        self.phase = GatePhase::Connecting;
    }

    /// The stream opened at `now`.
    pub fn on_open(&mut self, now: Instant) {
        self.phase = GatePhase::WarmingUp {
            until: now + self.config.warmup,
        };
    }

    /// When warm-up ends, if it is in progress.
    pub fn warmup_deadline(&self) -> Option<Instant> {
        match self.phase {
            GatePhase::WarmingUp { until } => Some(until),
            _ => None,
        }
    }

    /// Finish warm-up if it has elapsed. Returns `true` exactly once per
    /// connection, when the initial pull should fire.
    pub fn poll_warmup(&mut self, now: Instant) -> bool {
        match self.phase {
            GatePhase::WarmingUp { until } if now >= until => {
                self.phase = GatePhase::Open;
                self.last_pull = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Classify one stream message received at `now`.
    pub fn on_message(&mut self, message: &StreamMessage, now: Instant) -> PullDecision {
        if !message.triggers_pull() {
            return PullDecision::Ignored;
        }
        if self.poll_warmup(now) {
            return PullDecision::Pull;
        }
        match self.phase {
            GatePhase::Connecting | GatePhase::WarmingUp { .. } => PullDecision::Blocked,
            GatePhase::Open => {
                let debounced = self
                    .last_pull
                    .is_some_and(|last| now.saturating_duration_since(last) < self.config.debounce);
                if debounced {
                    PullDecision::Debounced
                } else {
                    self.last_pull = Some(now);
                    PullDecision::Pull
                }
            }
        }
    }
}
