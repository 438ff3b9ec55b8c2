//! Poke and status response envelopes.

use serde::{Deserialize, Serialize};

/// Response to a targeted or broadcast wake-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokeResponse {
    pub success: bool,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "clientsNotified")]
    pub clients_notified: usize,
}

/// Error envelope for every non-2xx relay response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Registry occupancy as reported by the status endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub clients: usize,
    pub users: usize,
}
