use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension};

use super::{Datastore, Key};
use crate::error::StoreError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);
"#;

/// Single-table SQLite datastore. Keys are stored in their cleaned string form.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Datastore for SqliteStore {
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        let value: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        value.ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn has(&self, key: &Key) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()
            .query_row("SELECT 1 FROM kv WHERE key = ?1", [key.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key.as_str(), value),
        )?;
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", [key.as_str()])?;
        Ok(())
    }

    fn query(&self, prefix: &str) -> Result<Vec<Key>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map([prefix], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(Key::new(row?));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(&temp.path().join("datastore/kv.sqlite")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_put_get_overwrite() {
        let (_temp, store) = open_temp();
        let key = Key::new("/b/ABC");
        store.put(&key, b"one").unwrap();
        store.put(&key, b"two").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"two");
        assert!(store.has(&key).unwrap());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_temp, store) = open_temp();
        let err = store.get(&Key::new("/missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(k) if k.as_str() == "/missing"));
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let (_temp, store) = open_temp();
        store.delete(&Key::new("/never")).unwrap();
    }

    #[test]
    fn test_query_prefix() {
        let (_temp, store) = open_temp();
        for name in ["/b/A", "/b/B", "/bx/C", "/local/pins"] {
            store.put(&Key::new(name), b"v").unwrap();
        }
        let keys = store.query("/b/").unwrap();
        assert_eq!(keys, vec![Key::new("/b/A"), Key::new("/b/B")]);
        assert_eq!(store.query("").unwrap().len(), 4);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("kv.sqlite");
        SqliteStore::open(&path)
            .unwrap()
            .put(&Key::new("/k"), &[1, 2, 3])
            .unwrap();
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&Key::new("/k")).unwrap(), vec![1, 2, 3]);
    }
}
