// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::value::Value;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("path not found")]
    NotFound,
}

/// Point-in-time read access to the base document tree. Implementations
/// hand the evaluator a consistent snapshot; the engine never writes.
pub trait Storage {
    fn read(&self, path: &[Value]) -> Result<Value, StorageError>;
}

/// Snapshot over an in-memory document. The `Value` tree is structurally
/// shared, so cloning out of the store is cheap.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    root: Value,
}

impl InMemoryStore {
    pub fn new(root: Value) -> InMemoryStore {
        InMemoryStore { root }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<InMemoryStore> {
        Ok(InMemoryStore {
            root: Value::from_json_str(json)?,
        })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }
}

impl Storage for InMemoryStore {
    fn read(&self, path: &[Value]) -> Result<Value, StorageError> {
        match self.root.get_path(path) {
            Value::Undefined => Err(StorageError::NotFound),
            v => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_follows_paths() {
        let store = InMemoryStore::from_json_str(r#"{"a": {"b": [1, 2]}}"#).unwrap();
        let path = [Value::from("a"), Value::from("b"), Value::from(1u64)];
        assert_eq!(store.read(&path).unwrap(), Value::from(2i64));
        assert!(store.read(&[Value::from("missing")]).is_err());
    }
}
