//! Notification dispatch.
//!
//! Delivery is at-most-once and best-effort: a poke is written to whatever
//! channels are open at that moment and is never retried or acknowledged.
//! A channel that turns out to be dead is deregistered by the registry and
//! the caller still sees success.

use crate::registry::ConnectionRegistry;
use protocol::{StreamMessage, UserId};
use std::sync::Arc;

/// Fans wake-ups out to the connection registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Wake up every channel owned by `user_id`.
    ///
    /// Returns how many channels the message was written to.
    pub fn notify(&self, user_id: &UserId, message: StreamMessage) -> usize {
        let notified = self.registry.notify_user(user_id, &message);
        tracing::debug!("Poked {} channel(s) of user {} with '{}'", notified, user_id, message);
        notified
    }

    /// Wake up every open channel regardless of owner.
    pub fn notify_all(&self, message: StreamMessage) -> usize {
        let notified = self.registry.notify_all(&message);
        tracing::debug!("Broadcast '{}' to {} channel(s)", message, notified);
        notified
    }

    /// The registry this dispatcher writes to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_notify_defaults_to_sync() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(4);
        registry.add_client(tx, Some(UserId::from("u1")));

        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        assert_eq!(dispatcher.notify(&UserId::from("u1"), StreamMessage::default()), 1);
        assert_eq!(rx.try_recv().unwrap(), StreamMessage::Sync);
    }

    #[test]
    fn test_dead_channel_reported_as_zero_not_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(4);
        registry.add_client(tx, Some(UserId::from("u1")));
        drop(rx);

        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        assert_eq!(dispatcher.notify(&UserId::from("u1"), StreamMessage::Sync), 0);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_notify_all() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        registry.add_client(tx1, Some(UserId::from("u1")));
        registry.add_client(tx2, None);

        let dispatcher = Dispatcher::new(registry);
        assert_eq!(dispatcher.notify_all(StreamMessage::Sync), 2);
    }
}
