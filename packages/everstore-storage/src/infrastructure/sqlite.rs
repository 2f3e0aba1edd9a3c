//! Native storage backend: an embedded, file-backed SQLite database.
//!
//! One table per object store (`key TEXT PRIMARY KEY, doc TEXT` JSON) plus
//! a shared blobs table. Secondary exact-match indices are expression
//! indices over `json_extract`. The backend owns the file handle through a
//! single connection; synchronous transactions are available and batched
//! writes run inside one, so they never partially apply.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::backend::{KvBackend, KvTransaction, TxBody};
use crate::error::{Result, StorageError};

#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                bytes BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn table_name(store: &str) -> Result<String> {
        if store.is_empty()
            || !store
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::not_supported(format!(
                "invalid store name: {:?}",
                store
            )));
        }
        Ok(format!("kv_{}", store))
    }

    fn ensure_store(conn: &Connection, store: &str) -> Result<String> {
        let table = Self::table_name(store)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    key TEXT PRIMARY KEY,
                    doc TEXT NOT NULL
                )",
                table
            ),
            [],
        )?;
        Ok(table)
    }

    fn parse_doc(raw: String) -> Result<Value> {
        serde_json::from_str(&raw)
            .map_err(|e| StorageError::corrupt(format!("stored document is not JSON: {}", e)))
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn declare_store(&self, store: &str, indexed_fields: &[&str]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        for field in indexed_fields {
            if !field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(StorageError::not_supported(format!(
                    "invalid indexed field: {:?}",
                    field
                )));
            }
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{}_{}\"
                     ON \"{}\" (json_extract(doc, '$.{}'))",
                    table, field, table, field
                ),
                [],
            )?;
        }
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT doc FROM \"{}\" WHERE key = ?1", table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(Self::parse_doc).transpose()
    }

    async fn put(&self, store: &str, key: &str, doc: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO \"{}\" (key, doc) VALUES (?1, ?2)",
                table
            ),
            params![key, serde_json::to_string(doc)?],
        )?;
        Ok(())
    }

    async fn put_many(&self, store: &str, entries: &[(String, Value)]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let tx = conn.unchecked_transaction()?;
        for (key, doc) in entries {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO \"{}\" (key, doc) VALUES (?1, ?2)",
                    table
                ),
                params![key, serde_json::to_string(doc)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let affected = conn.execute(
            &format!("DELETE FROM \"{}\" WHERE key = ?1", table),
            params![key],
        )?;
        Ok(affected > 0)
    }

    async fn delete_many(&self, store: &str, keys: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let tx = conn.unchecked_transaction()?;
        for key in keys {
            tx.execute(
                &format!("DELETE FROM \"{}\" WHERE key = ?1", table),
                params![key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn scan(&self, store: &str) -> Result<Vec<Value>> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let mut stmt = conn.prepare(&format!("SELECT doc FROM \"{}\" ORDER BY key", table))?;
        let raws = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(Self::parse_doc).collect()
    }

    async fn find_by_field(&self, store: &str, field: &str, value: &Value) -> Result<Vec<Value>> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let path = format!("$.{}", field);

        // Scalar comparisons run against the expression index; anything
        // else falls back to scanning and filtering in process.
        let sql = format!(
            "SELECT doc FROM \"{}\" WHERE json_extract(doc, ?1) = ?2 ORDER BY key",
            table
        );
        let raws: Vec<String> = match value {
            Value::String(s) => {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![path, s], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Value::Number(n) => {
                let mut stmt = conn.prepare(&sql)?;
                if let Some(i) = n.as_i64() {
                    let rows = stmt
                        .query_map(params![path, i], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    let rows = stmt
                        .query_map(params![path, f], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            }
            Value::Bool(b) => {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![path, *b as i64], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            _ => {
                let mut stmt =
                    conn.prepare(&format!("SELECT doc FROM \"{}\" ORDER BY key", table))?;
                let all = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                drop(stmt);
                let mut matched = Vec::new();
                for raw in all {
                    let doc = Self::parse_doc(raw.clone())?;
                    if doc.get(field) == Some(value) {
                        matched.push(raw);
                    }
                }
                matched
            }
        };
        raws.into_iter().map(Self::parse_doc).collect()
    }

    async fn count(&self, store: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let table = Self::ensure_store(&conn, store)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT bytes FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (key, bytes) VALUES (?1, ?2)",
            params![key, bytes],
        )?;
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn transaction(&self, body: TxBody<'_>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut ctx = SqliteTx { tx: &tx };
        body(&mut ctx)?;
        tx.commit()?;
        Ok(())
    }
}

struct SqliteTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl KvTransaction for SqliteTx<'_> {
    fn get(&mut self, store: &str, key: &str) -> Result<Option<Value>> {
        let table = SqliteBackend::ensure_store(self.tx, store)?;
        let raw: Option<String> = self
            .tx
            .query_row(
                &format!("SELECT doc FROM \"{}\" WHERE key = ?1", table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(SqliteBackend::parse_doc).transpose()
    }

    fn put(&mut self, store: &str, key: &str, doc: &Value) -> Result<()> {
        let table = SqliteBackend::ensure_store(self.tx, store)?;
        self.tx.execute(
            &format!(
                "INSERT OR REPLACE INTO \"{}\" (key, doc) VALUES (?1, ?2)",
                table
            ),
            params![key, serde_json::to_string(doc)?],
        )?;
        Ok(())
    }

    fn delete(&mut self, store: &str, key: &str) -> Result<bool> {
        let table = SqliteBackend::ensure_store(self.tx, store)?;
        let affected = self.tx.execute(
            &format!("DELETE FROM \"{}\" WHERE key = ?1", table),
            params![key],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .put("notes", "a", &json!({"title": "A"}))
            .await
            .unwrap();

        let doc = backend.get("notes", "a").await.unwrap().unwrap();
        assert_eq!(doc["title"], "A");

        assert!(backend.delete("notes", "a").await.unwrap());
        assert!(!backend.delete("notes", "a").await.unwrap());
        assert!(backend.get("notes", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_field_string() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .declare_store("notes", &["syncStatus"])
            .await
            .unwrap();
        backend
            .put("notes", "a", &json!({"syncStatus": "local"}))
            .await
            .unwrap();
        backend
            .put("notes", "b", &json!({"syncStatus": "synced"}))
            .await
            .unwrap();

        let found = backend
            .find_by_field("notes", "syncStatus", &json!("local"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["syncStatus"], "local");
    }

    #[tokio::test]
    async fn test_find_by_field_number_and_bool() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .put("t", "a", &json!({"n": 3, "flag": true}))
            .await
            .unwrap();
        backend
            .put("t", "b", &json!({"n": 4, "flag": false}))
            .await
            .unwrap();

        let found = backend.find_by_field("t", "n", &json!(3)).await.unwrap();
        assert_eq!(found.len(), 1);

        let found = backend
            .find_by_field("t", "flag", &json!(true))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["n"], 3);
    }

    #[tokio::test]
    async fn test_scan_orders_by_key() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.put("t", "b", &json!({"i": 2})).await.unwrap();
        backend.put("t", "a", &json!({"i": 1})).await.unwrap();
        backend.put("t", "c", &json!({"i": 3})).await.unwrap();

        let docs = backend.scan("t").await.unwrap();
        let order: Vec<i64> = docs.iter().map(|d| d["i"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert!(backend.supports_transactions());

        backend
            .transaction(Box::new(|tx| {
                tx.put("t", "a", &json!({"i": 1}))?;
                tx.put("t", "b", &json!({"i": 2}))?;
                Ok(())
            }))
            .unwrap();
        assert_eq!(backend.count("t").await.unwrap(), 2);

        let result = backend.transaction(Box::new(|tx| {
            tx.put("t", "c", &json!({"i": 3}))?;
            Err(StorageError::database("forced failure"))
        }));
        assert!(result.is_err());
        assert_eq!(backend.count("t").await.unwrap(), 2);
        assert!(backend.get("t", "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blobs() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.put_blob("idx", &[1, 2, 3]).await.unwrap();
        assert_eq!(backend.get_blob("idx").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(backend.delete_blob("idx").await.unwrap());
        assert_eq!(backend.get_blob("idx").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backed_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.put("t", "a", &json!({"i": 1})).await.unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let doc = backend.get("t", "a").await.unwrap().unwrap();
        assert_eq!(doc["i"], 1);
    }

    #[tokio::test]
    async fn test_invalid_store_name_rejected() {
        let backend = SqliteBackend::in_memory().unwrap();
        let err = backend
            .put("bad name; DROP TABLE", "a", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_corrupt_document_surfaces() {
        let backend = SqliteBackend::in_memory().unwrap();
        {
            let conn = backend.conn.lock().unwrap();
            SqliteBackend::ensure_store(&conn, "t").unwrap();
            conn.execute(
                "INSERT INTO \"kv_t\" (key, doc) VALUES ('a', 'not json')",
                [],
            )
            .unwrap();
        }
        let err = backend.get("t", "a").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Corrupt);
    }
}
