//! Browser-style storage backend.
//!
//! Mirrors the execution model of the browser's object-store database:
//! every operation is asynchronous, keys live inside named object stores,
//! writes to one store serialize behind a single writer, and synchronous
//! transactions do not exist (`transaction` fails with `NotSupported`).
//! On native targets this backend doubles as the in-memory store for
//! tests; on wasm it is the binding point for IndexedDB.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::backend::{KvBackend, TxBody};
use crate::error::{Result, StorageError};

#[derive(Default)]
pub struct IndexedBackend {
    stores: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl IndexedBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for IndexedBackend {
    fn name(&self) -> &'static str {
        "indexed"
    }

    async fn declare_store(&self, store: &str, _indexed_fields: &[&str]) -> Result<()> {
        // Index declarations are metadata-only here; lookups filter over
        // the store contents.
        self.stores
            .write()
            .await
            .entry(store.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .and_then(|s| s.get(key))
            .cloned())
    }

    async fn put(&self, store: &str, key: &str, doc: &Value) -> Result<()> {
        self.stores
            .write()
            .await
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), doc.clone());
        Ok(())
    }

    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> Result<()> {
        let mut stores = self.stores.write().await;
        let target = stores.entry(store.to_string()).or_default();
        for (key, doc) in entries {
            target.insert(key.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        Ok(self
            .stores
            .write()
            .await
            .get_mut(store)
            .map(|s| s.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn delete_many(&self, store: &str, keys: &[String]) -> Result<()> {
        let mut stores = self.stores.write().await;
        if let Some(target) = stores.get_mut(store) {
            for key in keys {
                target.remove(key);
            }
        }
        Ok(())
    }

    async fn scan(&self, store: &str) -> Result<Vec<Value>> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_by_field(&self, store: &str, field: &str, value: &Value) -> Result<Vec<Value>> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .map(|s| {
                s.values()
                    .filter(|doc| doc.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, store: &str) -> Result<u64> {
        Ok(self
            .stores
            .read()
            .await
            .get(store)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(key).is_some())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn transaction(&self, _body: TxBody<'_>) -> Result<()> {
        Err(StorageError::not_supported(
            "synchronous transactions are unavailable on the indexed backend",
        ))
    }
}
