//! Routing of pushed mutations to per-domain handlers.
//!
//! Each client group (todo, food, diary, ideas) registers a
//! [`DomainHandler`]. A new domain is added by registering a handler, not by
//! editing the push path. Mutations for an unregistered group are logged and
//! ignored, never an error.

use protocol::{ClientGroupId, ClientId, Mutation, ProfileId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a domain handler may report for a single mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The handler has no mutator with this name.
    #[error("Unknown mutator: {0}")]
    UnknownMutator(String),

    /// The arguments do not fit the mutator.
    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    /// The handler refused the mutation.
    #[error("Mutation rejected: {0}")]
    Rejected(String),
}

/// Who a mutation came from.
#[derive(Clone, Copy, Debug)]
pub struct PushContext<'a> {
    pub client_id: &'a ClientId,
    pub client_group_id: &'a ClientGroupId,
    pub profile_id: Option<&'a ProfileId>,
}

/// Applies the mutations of one data domain.
pub trait DomainHandler: Send + Sync {
    fn apply(&self, ctx: &PushContext<'_>, mutation: &Mutation) -> Result<(), DomainError>;
}

/// Handler that accepts every mutation without touching any state.
///
/// Domain business logic lives in the backend that serves pulls; the relay
/// only needs to acknowledge the mutation stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

impl DomainHandler for AcknowledgeHandler {
    fn apply(&self, ctx: &PushContext<'_>, mutation: &Mutation) -> Result<(), DomainError> {
        tracing::debug!(
            "[{}] acknowledged {}#{} from {}",
            ctx.client_group_id,
            mutation.name,
            mutation.id,
            ctx.client_id
        );
        Ok(())
    }
}

/// Result of routing one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A handler accepted the mutation.
    Applied,
    /// A handler reported an error.
    Failed(DomainError),
    /// No handler is registered for the group.
    UnknownGroup,
}

/// Map from client group to its handler.
#[derive(Default, Clone)]
pub struct ClientGroupRouter {
    handlers: HashMap<ClientGroupId, Arc<dyn DomainHandler>>,
}

impl ClientGroupRouter {
    /// Create a router with no groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a router acknowledging every group in `groups`.
    pub fn acknowledging<I>(groups: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ClientGroupId>,
    {
        let mut router = Self::new();
        for group in groups {
            router.register(group, Arc::new(AcknowledgeHandler));
        }
        router
    }

    /// Register a handler, returning the one it replaces.
    pub fn register(
        &mut self,
        group: impl Into<ClientGroupId>,
        handler: Arc<dyn DomainHandler>,
    ) -> Option<Arc<dyn DomainHandler>> {
        self.handlers.insert(group.into(), handler)
    }

    /// Remove the handler for a group.
    pub fn unregister(&mut self, group: &ClientGroupId) -> Option<Arc<dyn DomainHandler>> {
        self.handlers.remove(group)
    }

    /// Whether a group has a handler.
    pub fn is_registered(&self, group: &ClientGroupId) -> bool {
        self.handlers.contains_key(group)
    }

    /// Registered groups, sorted.
    pub fn groups(&self) -> Vec<ClientGroupId> {
        let mut groups: Vec<_> = self.handlers.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Hand one mutation to its group's handler.
    pub fn route(&self, ctx: &PushContext<'_>, mutation: &Mutation) -> RouteOutcome {
        match self.handlers.get(ctx.client_group_id) {
            Some(handler) => match handler.apply(ctx, mutation) {
                Ok(()) => RouteOutcome::Applied,
                Err(e) => RouteOutcome::Failed(e),
            },
            None => RouteOutcome::UnknownGroup,
        }
    }
}
