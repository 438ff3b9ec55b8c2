//! Pull envelopes.
//!
//! The pull endpoint itself belongs to the domain backend. These types only
//! capture the contract a replica relies on when it reconciles.

use crate::identity::{ClientGroupId, ClientId, ProfileId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Pull protocol version sent with every request.
pub const PULL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    #[serde(rename = "profileID")]
    pub profile_id: ProfileId,
    pub cookie: Value,
    #[serde(rename = "pullVersion")]
    pub pull_version: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub cookie: Value,
    /// Server watermark per client that changed since the request cookie.
    #[serde(rename = "lastMutationIDChanges", default)]
    pub last_mutation_id_changes: HashMap<ClientId, u64>,
    #[serde(default)]
    pub patch: Vec<PatchOperation>,
}

/// One step of the authoritative state delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Put { key: String, value: Value },
    Del { key: String },
    Clear,
}
