//! Key-value stores a repository can be backed by.
//!
//! Every backend implements [`Datastore`]; [`open`] builds one from a
//! [`DatastoreSpec`] found in the repo config or hard-coded by a migration
//! step that knows a legacy layout.

pub mod flatfs;
#[cfg(test)]
pub mod memory;
pub mod mount;
pub mod sqlite;

use std::fmt;
use std::path::Path;

use crate::config::DatastoreSpec;
use crate::error::StoreError;

pub use flatfs::FlatfsStore;
pub use mount::MountStore;
pub use sqlite::SqliteStore;

/// A cleaned, slash-separated datastore key such as `/blocks/CIQA...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Builds a key, ensuring a leading `/`, collapsing repeated separators and
    /// dropping a trailing `/`.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref();
        let mut cleaned = String::with_capacity(raw.len() + 1);
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            cleaned.push('/');
            cleaned.push_str(segment);
        }
        if cleaned.is_empty() {
            cleaned.push('/');
        }
        Key(cleaned)
    }

    pub fn root() -> Self {
        Key("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, empty for the root key.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn parent(&self) -> Key {
        match self.0.rfind('/') {
            Some(0) | None => Key::root(),
            Some(idx) => Key(self.0[..idx].to_string()),
        }
    }

    pub fn child(&self, name: &str) -> Key {
        Key::new(format!("{}/{}", self.0, name))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage contract the migration engine relies on.
///
/// `delete` of an absent key succeeds and `put` overwrites, which is what
/// makes rerunning an interrupted bulk transfer safe.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError>;

    fn has(&self, key: &Key) -> Result<bool, StoreError>;

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &Key) -> Result<(), StoreError>;

    /// Keys whose string form starts with `prefix`, in key order.
    fn query(&self, prefix: &str) -> Result<Vec<Key>, StoreError>;

    /// Makes every completed write durable.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens the store described by `spec`; relative paths resolve against `root`.
pub fn open(root: &Path, spec: &DatastoreSpec) -> Result<Box<dyn Datastore>, StoreError> {
    match spec {
        DatastoreSpec::Sqlite { path } => Ok(Box::new(SqliteStore::open(&root.join(path))?)),
        DatastoreSpec::Flatfs { path, shard } => {
            Ok(Box::new(FlatfsStore::open(&root.join(path), *shard)?))
        }
        DatastoreSpec::Mount { mounts } => {
            let mut children = Vec::with_capacity(mounts.len());
            for mount in mounts {
                children.push((Key::new(&mount.prefix), open(root, &mount.child)?));
            }
            Ok(Box::new(MountStore::new(children)))
        }
    }
}
