use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::Key;

/// Failures raised by a [`Datastore`](crate::store::Datastore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {0} not found")]
    NotFound(Key),
    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Store operation that failed while moving an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    Query,
    Get,
    Put,
    Delete,
}

impl fmt::Display for KeyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            KeyOp::Query => "query",
            KeyOp::Get => "get",
            KeyOp::Put => "put",
            KeyOp::Delete => "delete",
        };
        f.write_str(op)
    }
}

/// Everything that can stop a migration step.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("repo at {} is locked by another process", path.display())]
    Locked { path: PathBuf },

    #[error("repo version is {found}, expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("cannot read version marker {}: {reason}", path.display())]
    VersionRead { path: PathBuf, reason: String },

    #[error("cannot write version marker {}", path.display())]
    VersionWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot load repo config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("cannot open datastore {location}")]
    StoreOpen {
        location: String,
        #[source]
        source: StoreError,
    },

    #[error("{op} failed for key {key}")]
    Transform {
        key: Key,
        op: KeyOp,
        #[source]
        source: StoreError,
    },

    #[error("{old} cannot be re-keyed: {new} already holds a different value")]
    Conflict { old: Key, new: Key },

    #[error("cannot open backup log {}", path.display())]
    BackupOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write backup log {}", path.display())]
    BackupWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read backup log {}", path.display())]
    BackupRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown migration step {0:?}")]
    UnknownStep(String),

    #[error("no migration step {direction} version {version}")]
    NoStepFor {
        direction: &'static str,
        version: u32,
    },

    #[error("migration {0} is not reversible")]
    NotReversible(String),

    #[error("{context} {}", path.display())]
    Filesystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MigrationError {
    pub(crate) fn transform(key: &Key, op: KeyOp, source: StoreError) -> Self {
        MigrationError::Transform {
            key: key.clone(),
            op,
            source,
        }
    }
}
