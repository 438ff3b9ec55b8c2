//! Push processing.
//!
//! A validated [`PushBatch`] is walked in array order. Each mutation is
//! routed to its client group's handler and, when its `id` is valid, raises
//! the batch watermark. After the loop the watermark is persisted with a
//! max-update and returned as `lastMutationID`.
//!
//! Mutations whose `id` is at or below the watermark stored when the batch
//! arrived were already processed by an earlier push. They are not routed
//! again, which keeps retries idempotent for the domain handlers as well as
//! for the counter.

use crate::groups::{ClientGroupRouter, PushContext, RouteOutcome};
use crate::progress::ProgressStore;
use protocol::PushBatch;
use std::sync::Arc;

/// What happened to one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Persisted watermark for the pushing client.
    pub last_mutation_id: u64,
    /// Mutations a handler accepted.
    pub applied: usize,
    /// Mutations already covered by the watermark.
    pub duplicates: usize,
    /// Mutations dropped for a malformed timestamp or id.
    pub skipped: usize,
    /// Mutations a handler reported an error for.
    pub failed: usize,
    /// Mutations for a group without a handler.
    pub unrouted: usize,
}

/// Applies push batches against a progress store.
pub struct PushProcessor {
    store: Arc<dyn ProgressStore>,
    groups: Arc<ClientGroupRouter>,
}

impl PushProcessor {
    pub fn new(store: Arc<dyn ProgressStore>, groups: Arc<ClientGroupRouter>) -> Self {
        Self { store, groups }
    }

    /// The progress store in use.
    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Process one batch and persist the resulting watermark.
    pub fn process(&self, batch: &PushBatch) -> PushOutcome {
        let client_id = &batch.client_id;
        let watermark = self.store.last_mutation_id(client_id);
        let ctx = PushContext {
            client_id,
            client_group_id: &batch.client_group_id,
            profile_id: batch.profile_id.as_ref(),
        };

        tracing::debug!(
            "Push from {} [{}]: {} mutation(s), watermark {}",
            client_id,
            batch.client_group_id,
            batch.mutations.len(),
            watermark
        );

        let mut outcome = PushOutcome::default();
        let mut new_last = watermark;

        for incoming in &batch.mutations {
            if !incoming.is_well_formed() {
                tracing::warn!(
                    "Skipping mutation {} ({}) from {}: timestamp is not a number",
                    incoming.index,
                    incoming.name,
                    client_id
                );
                outcome.skipped += 1;
                continue;
            }

            let Some(mutation) = incoming.to_mutation() else {
                tracing::warn!(
                    "Skipping mutation {} ({}) from {}: id is not a valid number",
                    incoming.index,
                    incoming.name,
                    client_id
                );
                outcome.skipped += 1;
                continue;
            };

            if mutation.id <= watermark {
                outcome.duplicates += 1;
                continue;
            }

            match self.groups.route(&ctx, &mutation) {
                RouteOutcome::Applied => outcome.applied += 1,
                RouteOutcome::Failed(e) => {
                    tracing::warn!(
                        "Handler for {} failed on {}#{}: {}",
                        batch.client_group_id,
                        mutation.name,
                        mutation.id,
                        e
                    );
                    outcome.failed += 1;
                }
                RouteOutcome::UnknownGroup => {
                    tracing::warn!(
                        "Unrecognized client group '{}', ignoring {}#{}",
                        batch.client_group_id,
                        mutation.name,
                        mutation.id
                    );
                    outcome.unrouted += 1;
                }
            }

            new_last = new_last.max(mutation.id);
        }

        outcome.last_mutation_id = self.store.advance(client_id, new_last);
        outcome
    }
}
