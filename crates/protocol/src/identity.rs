//! Identifiers carried by replicas and connections.
//!
//! A single user (`UserId`, or `ProfileId` on the replica side) may run
//! many replicas at once, one per tab or device. Each replica has its own
//! `ClientId` and belongs to exactly one data domain, its `ClientGroupId`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from any string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of one local replica instance.
    ///
    /// Globally unique and never reused after rotation.
    ClientId
);

string_id!(
    /// The data domain a replica belongs to (todo, food, diary, ideas).
    ClientGroupId
);

string_id!(
    /// Stable per logical user across replica instances.
    ProfileId
);

string_id!(
    /// Owner of a notification channel, as established by authentication.
    UserId
);

impl ClientId {
    /// Generate a new unique client ID.
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }
}

impl ClientGroupId {
    pub const TODO: &'static str = "todo-replicache-flat";
    pub const FOOD: &'static str = "food-replicache-flat";
    pub const DIARY: &'static str = "diary-replicache-flat";
    pub const IDEAS: &'static str = "ideas-replicache-flat";

    /// The client groups every relay recognizes out of the box.
    pub fn defaults() -> [ClientGroupId; 4] {
        [
            ClientGroupId::from(Self::TODO),
            ClientGroupId::from(Self::FOOD),
            ClientGroupId::from(Self::DIARY),
            ClientGroupId::from(Self::IDEAS),
        ]
    }
}

/// Full identity of a replica as sent with every push and pull.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    #[serde(rename = "profileID")]
    pub profile_id: ProfileId,
}

impl ClientIdentity {
    /// Create an identity with a freshly generated client ID.
    pub fn new(client_group_id: impl Into<ClientGroupId>, profile_id: impl Into<ProfileId>) -> Self {
        Self {
            client_id: ClientId::generate(),
            client_group_id: client_group_id.into(),
            profile_id: profile_id.into(),
        }
    }

    /// Replace the client ID with a new one and return the retired ID.
    ///
    /// The new mutation stream starts from scratch on the server because
    /// progress is keyed by client ID.
    pub fn rotate(&mut self) -> ClientId {
        std::mem::replace(&mut self.client_id, ClientId::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_generation() {
        let id1 = ClientId::generate();
        let id2 = ClientId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_rotate_never_reuses() {
        let mut identity = ClientIdentity::new(ClientGroupId::TODO, "profile-1");
        let first = identity.client_id.clone();
        let retired = identity.rotate();
        assert_eq!(retired, first);
        assert_ne!(identity.client_id, first);
        assert_eq!(identity.profile_id.as_str(), "profile-1");
    }

    #[test]
    fn test_identity_wire_names() {
        let identity = ClientIdentity {
            client_id: "c1".into(),
            client_group_id: ClientGroupId::TODO.into(),
            profile_id: "p1".into(),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["clientID"], "c1");
        assert_eq!(json["clientGroupID"], "todo-replicache-flat");
        assert_eq!(json["profileID"], "p1");
    }

    #[test]
    fn test_default_groups() {
        let groups = ClientGroupId::defaults();
        assert_eq!(groups.len(), 4);
        assert!(groups.contains(&ClientGroupId::from("todo-replicache-flat")));
    }
}
