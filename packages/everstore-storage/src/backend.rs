//! Backend port: the key/value persistence contract.
//!
//! Both storage backends expose the same object-store model: named stores
//! of JSON documents keyed by string, per-attribute exact-match lookups,
//! and opaque blob slots for serialized vector indexes. The native backend
//! additionally offers synchronous transactions; the browser-style backend
//! reports `NotSupported` for them and callers compose operations without
//! cross-entity atomicity.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Synchronous transaction context. All reads and writes commit together
/// when the body returns `Ok` and roll back on `Err`.
pub trait KvTransaction {
    fn get(&mut self, store: &str, key: &str) -> Result<Option<Value>>;
    fn put(&mut self, store: &str, key: &str, doc: &Value) -> Result<()>;
    fn delete(&mut self, store: &str, key: &str) -> Result<bool>;
}

pub type TxBody<'a> = Box<dyn FnOnce(&mut dyn KvTransaction) -> Result<()> + Send + 'a>;

/// Storage backend contract.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Ensure an object store exists and declare its exact-match secondary
    /// indices. Stores are also created lazily on first write; declaring
    /// them up front lets the backend build indices before data arrives.
    async fn declare_store(&self, store: &str, indexed_fields: &[&str]) -> Result<()>;

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, store: &str, key: &str, doc: &Value) -> Result<()>;

    /// Batched upsert. Atomic on backends with synchronous transactions,
    /// sequential otherwise.
    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> Result<()>;

    async fn delete(&self, store: &str, key: &str) -> Result<bool>;

    async fn delete_many(&self, store: &str, keys: &[String]) -> Result<()>;

    /// All documents in a store, ordered by key.
    async fn scan(&self, store: &str) -> Result<Vec<Value>>;

    /// Exact match on a top-level document field.
    async fn find_by_field(&self, store: &str, field: &str, value: &Value) -> Result<Vec<Value>>;

    async fn count(&self, store: &str) -> Result<u64>;

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn delete_blob(&self, key: &str) -> Result<bool>;

    fn supports_transactions(&self) -> bool;

    /// Run `body` inside a synchronous transaction. Fails with
    /// `NotSupported` on backends without one.
    fn transaction(&self, body: TxBody<'_>) -> Result<()>;
}
