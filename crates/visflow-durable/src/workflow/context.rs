//! Append-only workflow context
//!
//! A stage's executor sees the union of the workflow's root context and the
//! outputs of the stages it depends on. Contexts never mutate in place:
//! enrichment produces a new context, and a key written twice is an error
//! rather than an overwrite.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ContextError {
    /// Two producers wrote the same key
    #[error("context key collision: {0}")]
    KeyCollision(String),

    /// A stage output was not a JSON object
    #[error("stage output must be a JSON object, got {0}")]
    NotAnObject(String),
}

/// Append-only mapping from string keys to opaque JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret a JSON object as a context. Stage results flow through this
    /// before merging, so a non-object result is rejected here.
    pub fn from_value(value: Value) -> Result<Self, ContextError> {
        match value {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            other => Err(ContextError::NotAnObject(other.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Produce a new context with one additional key.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Result<Self, ContextError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(ContextError::KeyCollision(key));
        }
        self.values.insert(key, value);
        Ok(self)
    }

    /// Union of two contexts; any shared key is a collision.
    pub fn merged(&self, other: &Context) -> Result<Context, ContextError> {
        let mut merged = self.values.clone();
        for (key, value) in &other.values {
            if merged.contains_key(key) {
                return Err(ContextError::KeyCollision(key.clone()));
            }
            merged.insert(key.clone(), value.clone());
        }
        Ok(Context { values: merged })
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values.into_iter().collect())
    }
}
