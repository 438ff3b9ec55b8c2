//! Mutation records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, argument-carrying state change originated by one client.
///
/// Within one `ClientId`, `id` values are strictly increasing. The same
/// mutation may arrive at the server more than once when a push is retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-local monotonic counter.
    pub id: u64,
    /// Name of the mutator to run.
    pub name: String,
    /// Opaque mutator arguments.
    #[serde(default)]
    pub args: Value,
    /// Creation time in milliseconds since epoch.
    pub timestamp: i64,
}

impl Mutation {
    pub fn new(id: u64, name: impl Into<String>, args: Value, timestamp: i64) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            timestamp,
        }
    }
}
