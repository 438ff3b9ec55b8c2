//! Wire protocol shared by daybook replicas and the sync relay.
//!
//! The relay and its clients exchange three kinds of traffic:
//!
//! - **push**: a client submits a batch of [`Mutation`]s and receives the
//!   server-held `lastMutationID` watermark for its [`ClientId`]
//! - **poke**: a lightweight wake-up fanned out over a server-sent event
//!   stream as [`StreamMessage`] frames
//! - **pull**: the client reconciles its local store against server truth
//!
//! # Modules
//!
//! - `identity`: client, client group, profile and user identifiers
//! - `mutation`: the mutation record pushed by clients
//! - `push`: push envelopes and push-body validation
//! - `pull`: pull envelopes and patch operations
//! - `poke`: poke and status response envelopes
//! - `stream`: notification stream messages
//! - `error`: schema errors
//!
//! # Example
//!
//! ```
//! use protocol::{PushBatch, StreamMessage};
//!
//! let body = br#"{
//!     "clientID": "c1",
//!     "clientGroupID": "todo-replicache-flat",
//!     "mutations": [{"id": 1, "name": "createTask", "args": {}, "timestamp": 1000}]
//! }"#;
//! let batch = PushBatch::from_json(body).unwrap();
//! assert_eq!(batch.mutations.len(), 1);
//!
//! assert!(StreamMessage::from("sync").triggers_pull());
//! ```

pub mod error;
pub mod identity;
pub mod mutation;
pub mod poke;
pub mod pull;
pub mod push;
pub mod stream;

pub use error::SchemaError;
pub use identity::{ClientGroupId, ClientId, ClientIdentity, ProfileId, UserId};
pub use mutation::Mutation;
pub use poke::{ErrorBody, PokeResponse, StatusResponse};
pub use pull::{PatchOperation, PullRequest, PullResponse, PULL_VERSION};
pub use push::{IncomingMutation, PushBatch, PushRequest, PushResponse};
pub use stream::StreamMessage;
