//! Push envelopes and push-body validation.
//!
//! Clients send a [`PushRequest`]. The relay does not deserialize that type
//! directly: it parses the body into a [`PushBatch`] so that a mutation with
//! a malformed timestamp can be skipped on its own instead of failing the
//! whole batch through serde.
//!
//! Batch-level rules (any failure rejects the whole batch):
//!
//! - the body is a JSON object
//! - `clientID` is a string
//! - `mutations` is an array
//! - every mutation is an object carrying a `timestamp` key
//!
//! Mutation-level rules (failure only marks that mutation):
//!
//! - `timestamp` must be a number, otherwise the mutation is skipped;
//!   fractional milliseconds are truncated
//! - `id` must be a non-negative integer, otherwise it does not count
//!   toward the progress counter

use crate::error::SchemaError;
use crate::identity::{ClientGroupId, ClientId, ProfileId};
use crate::mutation::Mutation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Push body as produced by a well-behaved client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    #[serde(rename = "profileID")]
    pub profile_id: ProfileId,
    #[serde(default)]
    pub cookie: Value,
    pub mutations: Vec<Mutation>,
}

/// Successful push response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
}

/// A mutation as received by the relay, before per-mutation checks.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMutation {
    /// Position in the submitted array.
    pub index: usize,
    /// `None` when the id is not a non-negative integer.
    pub id: Option<u64>,
    pub name: String,
    pub args: Value,
    /// `None` when the timestamp is present but not a number.
    pub timestamp: Option<i64>,
}

impl IncomingMutation {
    /// Whether the mutation may be routed to a domain handler.
    pub fn is_well_formed(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Convert into a typed mutation if every field is valid.
    pub fn to_mutation(&self) -> Option<Mutation> {
        Some(Mutation {
            id: self.id?,
            name: self.name.clone(),
            args: self.args.clone(),
            timestamp: self.timestamp?,
        })
    }

    fn from_value(index: usize, value: Value) -> Result<Self, SchemaError> {
        let Value::Object(mut fields) = value else {
            return Err(SchemaError::InvalidMutation {
                index,
                reason: "mutation must be an object",
            });
        };

        let timestamp = match fields.remove("timestamp") {
            Some(raw) => as_timestamp(&raw),
            None => {
                return Err(SchemaError::InvalidMutation {
                    index,
                    reason: "timestamp is required",
                })
            }
        };

        let id = fields.get("id").and_then(as_integer).and_then(|id| u64::try_from(id).ok());
        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            _ => String::new(),
        };
        let args = fields.remove("args").unwrap_or(Value::Null);

        Ok(Self {
            index,
            id,
            name,
            args,
            timestamp,
        })
    }
}

/// A push body that passed batch-level validation.
#[derive(Clone, Debug, PartialEq)]
pub struct PushBatch {
    pub client_id: ClientId,
    /// Empty when the client did not send one; routed as an unknown group.
    pub client_group_id: ClientGroupId,
    pub profile_id: Option<ProfileId>,
    pub cookie: Value,
    pub mutations: Vec<IncomingMutation>,
}

impl PushBatch {
    /// Parse and validate a raw push body.
    pub fn from_json(body: &[u8]) -> Result<Self, SchemaError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate an already parsed push body.
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let Value::Object(mut body) = value else {
            return Err(SchemaError::NotAnObject);
        };

        let client_id = match body.remove("clientID") {
            Some(Value::String(id)) => ClientId(id),
            _ => {
                return Err(SchemaError::InvalidField {
                    field: "clientID",
                    expected: "a string",
                })
            }
        };

        let raw_mutations = match body.remove("mutations") {
            Some(Value::Array(mutations)) => mutations,
            _ => {
                return Err(SchemaError::InvalidField {
                    field: "mutations",
                    expected: "an array",
                })
            }
        };

        let mutations = raw_mutations
            .into_iter()
            .enumerate()
            .map(|(index, m)| IncomingMutation::from_value(index, m))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client_id,
            client_group_id: ClientGroupId(take_string(&mut body, "clientGroupID").unwrap_or_default()),
            profile_id: take_string(&mut body, "profileID").map(ProfileId),
            cookie: body.remove("cookie").unwrap_or(Value::Null),
            mutations,
        })
    }
}

fn take_string(body: &mut Map<String, Value>, key: &str) -> Option<String> {
    match body.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Any JSON number, truncated to whole milliseconds.
fn as_timestamp(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    // `as` saturates at the i64 bounds.
    n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))
}

/// Interpret a JSON number as an integer, accepting integral floats.
fn as_integer(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(value: Value) -> Result<PushBatch, SchemaError> {
        PushBatch::from_value(value)
    }

    #[test]
    fn test_valid_batch() {
        let b = batch(json!({
            "clientID": "c1",
            "clientGroupID": "todo-replicache-flat",
            "profileID": "p1",
            "cookie": 7,
            "mutations": [
                {"id": 1, "name": "createTask", "args": {"title": "Buy milk"}, "timestamp": 1000}
            ]
        }))
        .unwrap();

        assert_eq!(b.client_id.as_str(), "c1");
        assert_eq!(b.client_group_id.as_str(), "todo-replicache-flat");
        assert_eq!(b.profile_id, Some(ProfileId::from("p1")));
        assert_eq!(b.cookie, json!(7));
        assert_eq!(b.mutations[0].id, Some(1));
        assert_eq!(b.mutations[0].timestamp, Some(1000));
        assert!(b.mutations[0].is_well_formed());
    }

    #[test]
    fn test_client_id_must_be_string() {
        let err = batch(json!({"clientID": 5, "mutations": []})).unwrap_err();
        assert_eq!(
            err,
            SchemaError::InvalidField {
                field: "clientID",
                expected: "a string"
            }
        );
        assert!(batch(json!({"mutations": []})).is_err());
    }

    #[test]
    fn test_mutations_must_be_array() {
        let err = batch(json!({"clientID": "c1", "mutations": {}})).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { field: "mutations", .. }));
    }

    #[test]
    fn test_missing_timestamp_rejects_batch() {
        let err = batch(json!({
            "clientID": "c1",
            "mutations": [
                {"id": 1, "name": "a", "timestamp": 1},
                {"id": 2, "name": "b"}
            ]
        }))
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::InvalidMutation {
                index: 1,
                reason: "timestamp is required"
            }
        );
    }

    #[test]
    fn test_non_numeric_timestamp_is_marked_not_rejected() {
        let b = batch(json!({
            "clientID": "c1",
            "mutations": [
                {"id": 1, "name": "a", "timestamp": "yesterday"},
                {"id": 2, "name": "b", "timestamp": 2}
            ]
        }))
        .unwrap();
        assert!(!b.mutations[0].is_well_formed());
        assert!(b.mutations[1].is_well_formed());
        assert_eq!(b.mutations[0].to_mutation(), None);
    }

    #[test]
    fn test_fractional_timestamp_is_a_number() {
        let b = batch(json!({
            "clientID": "c1",
            "mutations": [
                {"id": 1, "name": "a", "timestamp": 1000.5},
                {"id": 2, "name": "b", "timestamp": 1.7e12}
            ]
        }))
        .unwrap();
        assert_eq!(b.mutations[0].timestamp, Some(1000));
        assert_eq!(b.mutations[1].timestamp, Some(1_700_000_000_000));
        assert!(b.mutations.iter().all(IncomingMutation::is_well_formed));
    }

    #[test]
    fn test_invalid_ids() {
        let b = batch(json!({
            "clientID": "c1",
            "mutations": [
                {"id": -1, "timestamp": 1},
                {"id": "7", "timestamp": 1},
                {"id": 4.0, "timestamp": 1},
                {"id": 4.5, "timestamp": 1}
            ]
        }))
        .unwrap();
        let ids: Vec<_> = b.mutations.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![None, None, Some(4), None]);
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            PushBatch::from_json(b"not json"),
            Err(SchemaError::InvalidJson(_))
        ));
        assert_eq!(PushBatch::from_json(b"[]"), Err(SchemaError::NotAnObject));
    }

    #[test]
    fn test_request_round_trips_through_batch() {
        let request = PushRequest {
            client_id: "c1".into(),
            client_group_id: "todo-replicache-flat".into(),
            profile_id: "p1".into(),
            cookie: Value::Null,
            mutations: vec![Mutation::new(9, "createTask", json!({}), 42)],
        };
        let body = serde_json::to_vec(&request).unwrap();
        let b = PushBatch::from_json(&body).unwrap();
        assert_eq!(b.mutations[0].to_mutation(), Some(request.mutations[0].clone()));
    }

    #[test]
    fn test_response_wire_name() {
        let json = serde_json::to_string(&PushResponse { last_mutation_id: 1 }).unwrap();
        assert_eq!(json, r#"{"lastMutationID":1}"#);
    }
}
