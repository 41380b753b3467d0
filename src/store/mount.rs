use std::cmp::Reverse;

use super::{Datastore, Key};
use crate::error::StoreError;

/// Routes each key to the child store mounted at its longest matching prefix.
///
/// Children see keys with the mount prefix stripped, so a flatfs mounted at
/// `/blocks` stores `/blocks/CIQX` as `/CIQX`.
pub struct MountStore {
    mounts: Vec<(Key, Box<dyn Datastore>)>,
}

impl MountStore {
    pub fn new(mut mounts: Vec<(Key, Box<dyn Datastore>)>) -> Self {
        // Longest prefix first, so the first match wins.
        mounts.sort_by_key(|(prefix, _)| Reverse(prefix.as_str().len()));
        Self { mounts }
    }

    fn route_index<'k>(&self, path: &'k str) -> Option<(usize, &'k str)> {
        self.mounts
            .iter()
            .enumerate()
            .find_map(|(idx, (prefix, _))| strip_mount(prefix, path).map(|rest| (idx, rest)))
    }

    fn route(&self, key: &Key) -> Result<(&dyn Datastore, Key), StoreError> {
        match self.route_index(key.as_str()) {
            Some((idx, rest)) => Ok((self.mounts[idx].1.as_ref(), Key::new(rest))),
            None => Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "no datastore mounted for this key",
            }),
        }
    }
}

/// Remainder of `path` below `prefix` when `path` sits at or under the mount.
fn strip_mount<'p>(prefix: &Key, path: &'p str) -> Option<&'p str> {
    if prefix.as_str() == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix.as_str())?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn remount(prefix: &Key, child_key: &Key) -> Key {
    if prefix.as_str() == "/" {
        child_key.clone()
    } else {
        Key::new(format!("{}{}", prefix, child_key))
    }
}

impl Datastore for MountStore {
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        let (store, child_key) = self.route(key)?;
        store.get(&child_key).map_err(|err| match err {
            StoreError::NotFound(_) => StoreError::NotFound(key.clone()),
            other => other,
        })
    }

    fn has(&self, key: &Key) -> Result<bool, StoreError> {
        let (store, child_key) = self.route(key)?;
        store.has(&child_key)
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        let (store, child_key) = self.route(key)?;
        store.put(&child_key, value)
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let (store, child_key) = self.route(key)?;
        store.delete(&child_key)
    }

    fn query(&self, prefix: &str) -> Result<Vec<Key>, StoreError> {
        let mut keys = Vec::new();
        let owner = self.route_index(prefix).map(|(idx, _)| idx);
        for (idx, (mount, store)) in self.mounts.iter().enumerate() {
            if owner == Some(idx) {
                // The mount holding the prefix itself; skip keys shadowed by a deeper mount.
                let rest = strip_mount(mount, prefix).unwrap_or(prefix);
                for child_key in store.query(rest)? {
                    let key = remount(mount, &child_key);
                    if self.route_index(key.as_str()).map(|(i, _)| i) == Some(idx) {
                        keys.push(key);
                    }
                }
            } else if mount.as_str() != "/" && mount.as_str().starts_with(prefix) {
                // Mounts nested below the prefix contribute everything they hold.
                for child_key in store.query("")? {
                    keys.push(remount(mount, &child_key));
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn sync(&self) -> Result<(), StoreError> {
        for (_, store) in &self.mounts {
            store.sync()?;
        }
        Ok(())
    }
}
