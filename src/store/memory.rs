use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Datastore, Key};
use crate::error::StoreError;

/// In-memory store for tests. `fail_puts_to` makes every put to that key fail,
/// which is how the abort paths get exercised.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<Key, Vec<u8>>>,
    fail_puts_to: Option<Key>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_puts_to(key: Key) -> Self {
        Self {
            entries: Mutex::default(),
            fail_puts_to: Some(key),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<Key, Vec<u8>> {
        self.entries().clone()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<Key, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Datastore for MemoryStore {
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        self.entries()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn has(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.entries().contains_key(key))
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_puts_to.as_ref() == Some(key) {
            return Err(StoreError::Io(io::Error::other("injected put failure")));
        }
        self.entries().insert(key.clone(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    fn query(&self, prefix: &str) -> Result<Vec<Key>, StoreError> {
        Ok(self
            .entries()
            .keys()
            .filter(|key| key.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }
}
