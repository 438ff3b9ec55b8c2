//! Typed records stored under namespaced keys.
//!
//! | Record | Key |
//! |---|---|
//! | [`Task`] | `task/<id>` |
//! | [`List`] | `list/<id>` |
//! | [`Item`] | `item/<id>` |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type with a key namespace.
pub trait Record: Serialize + DeserializeOwned {
    /// Key prefix including the trailing slash.
    const PREFIX: &'static str;

    fn id(&self) -> &str;

    fn key_for(id: &str) -> String {
        format!("{}{}", Self::PREFIX, id)
    }

    fn key(&self) -> String {
        Self::key_for(self.id())
    }
}

/// A todo entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Record for Task {
    const PREFIX: &'static str = "task/";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A shopping list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
}

impl Record for List {
    const PREFIX: &'static str = "list/";

    fn id(&self) -> &str {
        &self.id
    }
}

/// An entry on a shopping list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub list_id: String,
    pub name: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub created_at: i64,
}

impl Record for Item {
    const PREFIX: &'static str = "item/";

    fn id(&self) -> &str {
        &self.id
    }
}
