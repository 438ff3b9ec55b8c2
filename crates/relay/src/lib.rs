//! Server side of daybook sync.
//!
//! The relay accepts mutation batches from replicas, tracks a per-client
//! `lastMutationID` watermark, and fans wake-ups ("pokes") out to every open
//! notification stream of a user so their other replicas re-pull.
//!
//! # Modules
//!
//! - `registry`: live notification channels, indexed by user
//! - `progress`: per-client `lastMutationID` storage
//! - `groups`: routing of mutations to per-domain handlers
//! - `push`: batch processing against the progress store
//! - `notify`: best-effort wake-up dispatch
//! - `auth`: bearer token verification
//! - `stream`: the per-connection server-sent event stream
//! - `server`: axum routes and the [`Relay`] service
//! - `config`: relay configuration
//! - `error`: error types and their HTTP mapping
//!
//! # Example
//!
//! ```no_run
//! use relay::{Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), relay::RelayError> {
//!     let relay = Relay::new(RelayConfig::with_port(8787).with_jwt_secret("secret"));
//!     relay.run().await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod groups;
pub mod notify;
pub mod progress;
pub mod push;
pub mod registry;
pub mod server;
pub mod stream;

pub use auth::{AuthError, Claims, TokenVerifier};
pub use config::{ConfigError, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use groups::{AcknowledgeHandler, ClientGroupRouter, DomainError, DomainHandler, PushContext};
pub use notify::Dispatcher;
pub use progress::{MemoryProgressStore, ProgressStore};
pub use push::{PushOutcome, PushProcessor};
pub use registry::{ConnectionGuard, ConnectionId, ConnectionRegistry};
pub use server::{bearer_token, Relay, ShutdownHandle};
pub use stream::notification_stream;
