//! The persistent-store port consumed by the sync engine, plus the
//! in-memory backend used by tests and ephemeral sessions.

use crate::error::StorageError;
use async_trait::async_trait;
use coffer_model::RawPayload;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Reserved value keys.
pub mod keys {
    pub const LAST_SYNC_TOKEN: &str = "LAST_SYNC_TOKEN";
    pub const PAGINATION_TOKEN: &str = "PAGINATION_TOKEN";
    pub const ROOT_KEY_PARAMS: &str = "ROOT_KEY_PARAMS";
    pub const WRAPPED_ROOT_KEY: &str = "WRAPPED_ROOT_KEY";
}

/// Key/value blob store for serialized payloads and engine bookkeeping.
///
/// Implement this for your platform:
/// - [`InMemoryStorage`] (testing, ephemeral sessions)
/// - an embedded database or file store (production)
#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn get_all_raw_payloads(&self) -> Result<Vec<RawPayload>, StorageError>;
    /// Saves wire-projected payload objects, keyed by their `uuid` field.
    async fn save_payloads(&self, payloads: &[Value]) -> Result<(), StorageError>;
    async fn delete_payload(&self, uuid: &str) -> Result<(), StorageError>;
    async fn get_value(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set_value(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn remove_value(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory backend.
pub struct InMemoryStorage {
    payloads: RwLock<HashMap<String, Value>>,
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            payloads: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored payload records (test introspection).
    pub fn payload_count(&self) -> usize {
        self.payloads.read().unwrap().len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoragePort for InMemoryStorage {
    async fn get_all_raw_payloads(&self) -> Result<Vec<RawPayload>, StorageError> {
        self.payloads
            .read()
            .unwrap()
            .values()
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| StorageError(format!("corrupt payload record: {}", e)))
            })
            .collect()
    }

    async fn save_payloads(&self, payloads: &[Value]) -> Result<(), StorageError> {
        let mut store = self.payloads.write().unwrap();
        for payload in payloads {
            let uuid = payload
                .get("uuid")
                .and_then(|v| v.as_str())
                .ok_or_else(|| StorageError("payload record without uuid".into()))?;
            store.insert(uuid.to_string(), payload.clone());
        }
        Ok(())
    }

    async fn delete_payload(&self, uuid: &str) -> Result<(), StorageError> {
        self.payloads.write().unwrap().remove(uuid);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.values.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_value(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn payload_roundtrip() {
        let storage = InMemoryStorage::new();
        storage
            .save_payloads(&[json!({"uuid": "a", "content_type": "Note"})])
            .await
            .unwrap();
        let raws = storage.get_all_raw_payloads().await.unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].uuid, "a");

        storage.delete_payload("a").await.unwrap();
        assert_eq!(storage.payload_count(), 0);
    }

    #[tokio::test]
    async fn values_roundtrip() {
        let storage = InMemoryStorage::new();
        storage
            .set_value(keys::LAST_SYNC_TOKEN, json!("token-1"))
            .await
            .unwrap();
        assert_eq!(
            storage.get_value(keys::LAST_SYNC_TOKEN).await.unwrap(),
            Some(json!("token-1"))
        );
        storage.remove_value(keys::LAST_SYNC_TOKEN).await.unwrap();
        assert_eq!(storage.get_value(keys::LAST_SYNC_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_rejects_uuidless_records() {
        let storage = InMemoryStorage::new();
        assert!(storage.save_payloads(&[json!({"content_type": "Note"})]).await.is_err());
    }
}
