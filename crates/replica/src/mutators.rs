//! Named mutators and the built-in todo and shopping set.
//!
//! A mutator is a deterministic transformation of the local store: given the
//! same committed state, arguments and [`MutationContext`], it must produce
//! the same writes. Replays after a pull depend on that, so mutators never
//! read the clock or generate IDs themselves. Record IDs travel in the
//! arguments and times come from the context.

use crate::error::MutatorError;
use crate::records::{Item, List, Record, Task};
use crate::store::WriteTransaction;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-mutation inputs besides the arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationContext {
    pub mutation_id: u64,
    /// Milliseconds since epoch, fixed when the mutation was dispatched.
    pub timestamp: i64,
}

/// A named state transformation.
pub trait Mutator: Send + Sync {
    fn apply(
        &self,
        tx: &mut WriteTransaction<'_>,
        args: &Value,
        ctx: &MutationContext,
    ) -> Result<Value, MutatorError>;
}

impl<F> Mutator for F
where
    F: Fn(&mut WriteTransaction<'_>, &Value, &MutationContext) -> Result<Value, MutatorError>
        + Send
        + Sync,
{
    fn apply(
        &self,
        tx: &mut WriteTransaction<'_>,
        args: &Value,
        ctx: &MutationContext,
    ) -> Result<Value, MutatorError> {
        self(tx, args, ctx)
    }
}

/// Mutators by name.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: HashMap<String, Arc<dyn Mutator>>,
}

impl MutatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the todo and shopping mutators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_todo();
        registry.register_shopping();
        registry
    }

    /// Register a mutator, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, mutator: impl Mutator + 'static) {
        self.mutators.insert(name.into(), Arc::new(mutator));
    }

    /// `createTask`, `updateTask`, `deleteTask`.
    pub fn register_todo(&mut self) {
        self.register("createTask", create_task);
        self.register("updateTask", update_task);
        self.register("deleteTask", delete_task);
    }

    /// `createList`, `deleteList`, `createItem`, `toggleItem`, `deleteItem`.
    pub fn register_shopping(&mut self) {
        self.register("createList", create_list);
        self.register("deleteList", delete_list);
        self.register("createItem", create_item);
        self.register("toggleItem", toggle_item);
        self.register("deleteItem", delete_item);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mutators.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.mutators.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the mutator `name` inside `tx`.
    pub fn run(
        &self,
        name: &str,
        tx: &mut WriteTransaction<'_>,
        args: &Value,
        ctx: &MutationContext,
    ) -> Result<Value, MutatorError> {
        let mutator = self
            .mutators
            .get(name)
            .ok_or_else(|| MutatorError::UnknownMutator(name.to_string()))?;
        mutator.apply(tx, args, ctx)
    }
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T, MutatorError> {
    T::deserialize(args).map_err(|e| MutatorError::InvalidArguments(e.to_string()))
}

fn non_empty(field: &str, value: String) -> Result<String, MutatorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MutatorError::InvalidArguments(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn load<T: Record>(tx: &WriteTransaction<'_>, id: &str) -> Result<T, MutatorError> {
    let key = T::key_for(id);
    tx.get_as::<T>(&key)?.ok_or(MutatorError::NotFound(key))
}

fn save<T: Record>(tx: &mut WriteTransaction<'_>, record: &T) -> Result<Value, MutatorError> {
    tx.put_as(record.key(), record)?;
    Ok(serde_json::to_value(record).unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
struct CreateTaskArgs {
    id: String,
    title: String,
    #[serde(default)]
    completed: bool,
}

fn create_task(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: CreateTaskArgs = parse(args)?;
    let task = Task {
        id: args.id,
        title: non_empty("title", args.title)?,
        completed: args.completed,
        created_at: ctx.timestamp,
        updated_at: ctx.timestamp,
    };
    save(tx, &task)
}

#[derive(Deserialize)]
struct UpdateTaskArgs {
    id: String,
    title: Option<String>,
    completed: Option<bool>,
}

fn update_task(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: UpdateTaskArgs = parse(args)?;
    let mut task: Task = load(tx, &args.id)?;
    if let Some(title) = args.title {
        task.title = non_empty("title", title)?;
    }
    if let Some(completed) = args.completed {
        task.completed = completed;
    }
    task.updated_at = ctx.timestamp;
    save(tx, &task)
}

fn delete_task(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    _ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: IdArgs = parse(args)?;
    Ok(json!(tx.del(&Task::key_for(&args.id))))
}

#[derive(Deserialize)]
struct CreateListArgs {
    id: String,
    name: String,
}

fn create_list(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: CreateListArgs = parse(args)?;
    let list = List {
        id: args.id,
        name: non_empty("name", args.name)?,
        created_at: ctx.timestamp,
    };
    save(tx, &list)
}

/// Deletes the list and every item on it.
fn delete_list(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    _ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: IdArgs = parse(args)?;
    let orphans: Vec<String> = tx
        .scan_prefix(Item::PREFIX)
        .into_iter()
        .filter(|(_, v)| v.get("listId").and_then(Value::as_str) == Some(args.id.as_str()))
        .map(|(k, _)| k)
        .collect();
    for key in &orphans {
        tx.del(key);
    }
    let existed = tx.del(&List::key_for(&args.id));
    Ok(json!({"deleted": existed, "itemsRemoved": orphans.len()}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateItemArgs {
    id: String,
    list_id: String,
    name: String,
}

fn create_item(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: CreateItemArgs = parse(args)?;
    let list: List = load(tx, &args.list_id)?;
    let item = Item {
        id: args.id,
        list_id: list.id,
        name: non_empty("name", args.name)?,
        checked: false,
        created_at: ctx.timestamp,
    };
    save(tx, &item)
}

#[derive(Deserialize)]
struct ToggleItemArgs {
    id: String,
    checked: Option<bool>,
}

/// Flips `checked`, or sets it when the arguments say which way.
fn toggle_item(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    _ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: ToggleItemArgs = parse(args)?;
    let mut item: Item = load(tx, &args.id)?;
    item.checked = args.checked.unwrap_or(!item.checked);
    save(tx, &item)
}

fn delete_item(
    tx: &mut WriteTransaction<'_>,
    args: &Value,
    _ctx: &MutationContext,
) -> Result<Value, MutatorError> {
    let args: IdArgs = parse(args)?;
    Ok(json!(tx.del(&Item::key_for(&args.id))))
}
