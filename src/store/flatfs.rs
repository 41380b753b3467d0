//! One-file-per-key block store.
//!
//! Key `/CIQXYZ` lives at `<dir>/<shard>/CIQXYZ.data`, where the shard
//! directory name is derived from the key name by the configured [`Shard`]
//! function. The function is recorded in `<dir>/SHARDING` on first open and
//! must match on every later open.

use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{Datastore, Key};
use crate::error::StoreError;

const SHARDING_FILE: &str = "SHARDING";
const DATA_EXTENSION: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shard {
    Prefix(usize),
    Suffix(usize),
    NextToLast(usize),
}

impl Default for Shard {
    fn default() -> Self {
        Shard::NextToLast(2)
    }
}

impl Shard {
    /// Shard directory for a key name (the key without its leading slash).
    pub fn dir_for(&self, name: &str) -> String {
        match *self {
            Shard::Prefix(len) => {
                let padded = format!("{name}{}", "_".repeat(len));
                padded[..len].to_string()
            }
            Shard::Suffix(len) => {
                let padded = format!("{}{name}", "_".repeat(len));
                padded[padded.len() - len..].to_string()
            }
            Shard::NextToLast(len) => {
                let padded = format!("{}{name}", "_".repeat(len + 1));
                let offset = padded.len() - len - 1;
                padded[offset..offset + len].to_string()
            }
        }
    }

    fn descriptor(&self) -> String {
        let (fun, len) = match *self {
            Shard::Prefix(len) => ("prefix", len),
            Shard::Suffix(len) => ("suffix", len),
            Shard::NextToLast(len) => ("next-to-last", len),
        };
        format!("/repo/flatfs/shard/v1/{fun}/{len}")
    }
}

pub struct FlatfsStore {
    dir: PathBuf,
    shard: Shard,
    /// Shard directories whose entries changed since the last `sync`.
    dirty: Mutex<BTreeSet<PathBuf>>,
}

impl FlatfsStore {
    pub fn open(dir: &Path, shard: Shard) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let sharding_path = dir.join(SHARDING_FILE);
        let descriptor = shard.descriptor();
        match fs::read_to_string(&sharding_path) {
            Ok(existing) if existing.trim() == descriptor => {}
            Ok(existing) => {
                return Err(StoreError::Io(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "flatfs at {} is sharded as {}, config asks for {}",
                        dir.display(),
                        existing.trim(),
                        descriptor
                    ),
                )));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::write(&sharding_path, format!("{descriptor}\n"))?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            shard,
            dirty: Mutex::default(),
        })
    }

    fn dirty(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_name<'k>(&self, key: &'k Key) -> Result<&'k str, StoreError> {
        let name = &key.as_str()[1..];
        if name.is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "flatfs keys need a name",
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "+-_=".contains(c))
        {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "flatfs keys are limited to [A-Z0-9+-_=] after the leading slash",
            });
        }
        Ok(name)
    }

    fn path_for(&self, key: &Key) -> Result<PathBuf, StoreError> {
        let name = self.key_name(key)?;
        Ok(self
            .dir
            .join(self.shard.dir_for(name))
            .join(format!("{name}.{DATA_EXTENSION}")))
    }
}

impl Datastore for FlatfsStore {
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(key)?) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.clone())),
            Err(err) => Err(err.into()),
        }
    }

    fn has(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let shard_dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey {
                key: key.to_string(),
                reason: "no shard directory",
            })?;
        fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|err| err.error)?;
        self.dirty().insert(shard_dir.to_path_buf());
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(shard_dir) = path.parent() {
                    self.dirty().insert(shard_dir.to_path_buf());
                }
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn query(&self, prefix: &str) -> Result<Vec<Key>, StoreError> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(DATA_EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let key = Key::new(stem);
                if key.as_str().starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Fsyncs every shard directory touched since the last call, then the
    /// top directory that holds them.
    fn sync(&self) -> Result<(), StoreError> {
        let mut dirty = self.dirty();
        #[cfg(unix)]
        {
            for shard_dir in dirty.iter() {
                sync_dir(shard_dir)?;
            }
            sync_dir(&self.dir)?;
        }
        dirty.clear();
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    match fs::File::open(dir) {
        Ok(handle) => Ok(handle.sync_all()?),
        // Emptied shards may already be gone.
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
