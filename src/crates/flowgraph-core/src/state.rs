//! State schema and reducers.
//!
//! Graph state is a JSON object. Each field carries reducer metadata declared
//! once per flow in a [`StateSchema`]: [`AppendReducer`] for append-only
//! lists (messages, chapters, logs), [`LastWriteReducer`] for everything
//! else. When multiple parallel tasks write the same field in one
//! super-step, the reducer decides how the writes combine.

use serde_json::Value;
use thiserror::Error;

use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while merging state updates.
#[derive(Debug, Error)]
pub enum StateError {
    /// Update was not a JSON object.
    #[error("invalid state update: {0}")]
    InvalidUpdate(String),

    /// Reducer could not merge the values.
    #[error("reducer error on field '{field}': {error}")]
    ReducerError {
        /// Field being merged.
        field: String,
        /// Description of the mismatch.
        error: String,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// How writes to one state field are merged.
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current`. `current` is `Null` for the first write.
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String>;

    /// Human-readable name, used in graph introspection.
    fn name(&self) -> &'static str;
}

/// Replace the current value with the update.
#[derive(Debug, Clone, Default)]
pub struct LastWriteReducer;

impl Reducer for LastWriteReducer {
    fn reduce(&self, _current: &Value, update: &Value) -> std::result::Result<Value, String> {
        Ok(update.clone())
    }

    fn name(&self) -> &'static str {
        "last_write"
    }
}

/// Append the update to the current array.
///
/// A scalar update is appended as a single element; an array update is
/// concatenated. A null current value initializes an empty list first.
#[derive(Debug, Clone, Default)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let mut items = match current {
            Value::Null => Vec::new(),
            Value::Array(existing) => existing.clone(),
            other => return Err(format!("cannot append to non-array value: {other}")),
        };
        match update {
            Value::Array(new_items) => items.extend(new_items.iter().cloned()),
            Value::Null => {}
            scalar => items.push(scalar.clone()),
        }
        Ok(Value::Array(items))
    }

    fn name(&self) -> &'static str {
        "append"
    }
}

/// Shallow-merge the update object into the current object.
///
/// Used for map-shaped fields written by parallel tasks in one super-step
/// (cluster status, chapters by file id): each task contributes its own keys
/// and none may clobber the others.
#[derive(Debug, Clone, Default)]
pub struct MergeReducer;

impl Reducer for MergeReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let mut merged = match current {
            Value::Null => serde_json::Map::new(),
            Value::Object(existing) => existing.clone(),
            other => return Err(format!("cannot merge into non-object value: {other}")),
        };
        match update {
            Value::Object(new_entries) => {
                for (key, value) in new_entries {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => return Err(format!("cannot merge non-object update: {other}")),
        }
        Ok(Value::Object(merged))
    }

    fn name(&self) -> &'static str {
        "merge"
    }
}

/// Per-flow state declaration: field name to reducer, with a last-write
/// default for undeclared fields.
#[derive(Clone, Default)]
pub struct StateSchema {
    fields: HashMap<String, Arc<dyn Reducer>>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field with an explicit reducer.
    pub fn field(mut self, name: impl Into<String>, reducer: Arc<dyn Reducer>) -> Self {
        self.fields.insert(name.into(), reducer);
        self
    }

    /// Declare an append-only field.
    pub fn append_field(self, name: impl Into<String>) -> Self {
        self.field(name, Arc::new(AppendReducer))
    }

    /// Declare a map field merged across parallel writers.
    pub fn merge_field(self, name: impl Into<String>) -> Self {
        self.field(name, Arc::new(MergeReducer))
    }

    /// Reducer for a field; last-write when undeclared.
    fn reducer_for(&self, field: &str) -> Arc<dyn Reducer> {
        self.fields
            .get(field)
            .cloned()
            .unwrap_or_else(|| Arc::new(LastWriteReducer))
    }

    /// Merge one update object into the state object, field by field.
    pub fn apply(&self, state: &mut serde_json::Map<String, Value>, update: &Value) -> Result<()> {
        let Value::Object(update) = update else {
            if update.is_null() {
                return Ok(());
            }
            return Err(StateError::InvalidUpdate(format!(
                "expected object, got {update}"
            )));
        };
        for (field, new_value) in update {
            let current = state.get(field).cloned().unwrap_or(Value::Null);
            let merged = self
                .reducer_for(field)
                .reduce(&current, new_value)
                .map_err(|error| StateError::ReducerError {
                    field: field.clone(),
                    error,
                })?;
            state.insert(field.clone(), merged);
        }
        Ok(())
    }

    /// Declared fields and their reducer names, for introspection.
    pub fn describe(&self) -> HashMap<String, &'static str> {
        self.fields
            .iter()
            .map(|(name, reducer)| (name.clone(), reducer.name()))
            .collect()
    }
}

impl std::fmt::Debug for StateSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSchema")
            .field("fields", &self.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn last_write_replaces() {
        let schema = StateSchema::new();
        let mut state = Map::new();
        schema.apply(&mut state, &json!({"status": "running"})).unwrap();
        schema.apply(&mut state, &json!({"status": "done"})).unwrap();
        assert_eq!(state["status"], "done");
    }

    #[test]
    fn append_accumulates_across_updates() {
        let schema = StateSchema::new().append_field("logs");
        let mut state = Map::new();
        schema.apply(&mut state, &json!({"logs": ["a"]})).unwrap();
        schema.apply(&mut state, &json!({"logs": ["b", "c"]})).unwrap();
        assert_eq!(state["logs"], json!(["a", "b", "c"]));
    }

    #[test]
    fn append_scalar_becomes_element() {
        let schema = StateSchema::new().append_field("chapters");
        let mut state = Map::new();
        schema.apply(&mut state, &json!({"chapters": "hoofdstuk 1"})).unwrap();
        assert_eq!(state["chapters"], json!(["hoofdstuk 1"]));
    }

    #[test]
    fn append_rejects_non_array_current() {
        let schema = StateSchema::new().append_field("logs");
        let mut state = Map::new();
        state.insert("logs".into(), json!(42));
        assert!(schema.apply(&mut state, &json!({"logs": ["x"]})).is_err());
    }

    #[test]
    fn merge_keeps_parallel_writers_keys() {
        let schema = StateSchema::new().merge_field("cluster_status");
        let mut state = Map::new();
        schema
            .apply(&mut state, &json!({"cluster_status": {"f1": {"status": "completed"}}}))
            .unwrap();
        schema
            .apply(&mut state, &json!({"cluster_status": {"f2": {"status": "failed"}}}))
            .unwrap();
        assert_eq!(state["cluster_status"]["f1"]["status"], "completed");
        assert_eq!(state["cluster_status"]["f2"]["status"], "failed");
    }

    #[test]
    fn null_update_is_noop() {
        let schema = StateSchema::new();
        let mut state = Map::new();
        state.insert("kept".into(), json!(1));
        schema.apply(&mut state, &Value::Null).unwrap();
        assert_eq!(state["kept"], 1);
    }
}
