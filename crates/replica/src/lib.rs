//! Client side of daybook sync.
//!
//! A [`Replica`] owns a local key-value store and applies named mutations to
//! it optimistically, then pushes them to the relay. A background
//! supervisor keeps the notification stream open and pulls when the relay
//! pokes, rebasing unconfirmed mutations on top of server truth.
//!
//! # Modules
//!
//! - `store`: transactional local key-value store with undo logs
//! - `records`: task, list and item records
//! - `mutators`: the mutator registry and built-in mutators
//! - `pending`: queue of unconfirmed mutations
//! - `replica`: dispatch, push, pull and rebase
//! - `status`: sync status tracking for UI badges
//! - `gate`: warm-up and debounce rules for pulls
//! - `supervisor`: reconnecting notification stream
//! - `transport`: the network seam and its HTTP implementation
//! - `sse`: event stream frame decoder
//! - `config`: endpoints and policies
//! - `error`: error types
//!
//! # Example
//!
//! ```no_run
//! use protocol::{ClientGroupId, ClientIdentity};
//! use replica::{HttpTransport, MutatorRegistry, Replica, ReplicaConfig, SessionIdentity};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), replica::ReplicaError> {
//!     let config = ReplicaConfig::new("http://localhost:8787");
//!     let transport = HttpTransport::new(&config);
//!     let replica = Replica::new(
//!         config,
//!         transport,
//!         ClientIdentity::new(ClientGroupId::TODO, "profile-1"),
//!         MutatorRegistry::with_defaults(),
//!         SessionIdentity::anonymous,
//!     );
//!     let sync = replica.spawn_sync();
//!
//!     replica
//!         .dispatch("createTask", json!({"id": "t1", "title": "Buy milk"}))
//!         .await?;
//!     println!("{}", replica.status().snapshot().label());
//!
//!     sync.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod mutators;
pub mod pending;
pub mod records;
pub mod replica;
pub mod sse;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use config::{GateConfig, PushFailurePolicy, ReplicaConfig, RetryPolicy};
pub use error::{MutatorError, ReplicaError, ReplicaResult, StoreError, TransportError};
pub use gate::{GatePhase, PullDecision, PullGate};
pub use mutators::{MutationContext, Mutator, MutatorRegistry};
pub use pending::{PendingMutation, PendingQueue};
pub use records::{Item, List, Record, Task};
pub use replica::{Dispatched, PullSummary, Replica, SyncHandle};
pub use sse::EventStreamDecoder;
pub use status::{SyncSnapshot, SyncState, SyncStatusTracker};
pub use store::{LocalStore, StoreChange, UndoLog, WriteTransaction};
pub use supervisor::{IdentitySource, SessionIdentity, SharedIdentity, ShutdownHandle, Supervisor};
pub use transport::{HttpTransport, MessageStream, SyncTransport};
