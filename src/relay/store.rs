//! Namespaced key-value store backed by SQLite.
//!
//! Values are stored as JSON text. Last write wins; there are no
//! transactions spanning multiple keys.

use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create a new in-memory store (used by tests).
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory store");
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema();
        store
    }

    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> Self {
        let conn = Connection::open(path).expect("Failed to open store");
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema();
        info!("Opened store at {:?}", path);
        store
    }

    fn init_schema(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .expect("Failed to create store schema");
    }

    /// Get a value, or `None` if absent or unparseable.
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .ok();

        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Unparseable value at {namespace}.{key}: {e}");
                None
            }
        }
    }

    /// Set a value, replacing any previous one.
    pub fn set<T: Serialize>(&self, namespace: &str, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to serialize value for {namespace}.{key}: {e}");
                return;
            }
        };

        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
            params![namespace, key, raw],
        ) {
            warn!("Failed to write {namespace}.{key}: {e}");
        }
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, namespace: &str, key: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        ) {
            warn!("Failed to remove {namespace}.{key}: {e}");
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let store = Store::new();
        store.set("ns", "answer", &42u32);
        assert_eq!(store.get::<u32>("ns", "answer"), Some(42));
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = Store::new();
        assert_eq!(store.get::<String>("ns", "nope"), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = Store::new();
        store.set("a", "key", &"one".to_string());
        store.set("b", "key", &"two".to_string());
        assert_eq!(store.get::<String>("a", "key"), Some("one".to_string()));
        assert_eq!(store.get::<String>("b", "key"), Some("two".to_string()));
    }

    #[test]
    fn test_last_write_wins() {
        let store = Store::new();
        store.set("ns", "key", &1u8);
        store.set("ns", "key", &2u8);
        assert_eq!(store.get::<u8>("ns", "key"), Some(2));
    }

    #[test]
    fn test_remove() {
        let store = Store::new();
        store.set("ns", "key", &1u8);
        store.remove("ns", "key");
        assert_eq!(store.get::<u8>("ns", "key"), None);
        // Removing again is harmless
        store.remove("ns", "key");
    }

    #[test]
    fn test_structured_values() {
        let store = Store::new();
        let value = serde_json::json!({"cid": "c_1", "rid": "r_1"});
        store.set("sessions", "continuation.42", &value);
        let loaded: Option<serde_json::Value> = store.get("sessions", "continuation.42");
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gweb.db");
        {
            let store = Store::open(&path);
            store.set("ns", "key", &"kept".to_string());
        }
        let store = Store::open(&path);
        assert_eq!(store.get::<String>("ns", "key"), Some("kept".to_string()));
    }
}
