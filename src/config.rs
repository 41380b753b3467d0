use crate::error::MigrationError;
use crate::paths::RepoPaths;
use crate::store::flatfs::Shard;
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;

const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Contents of `<repo>/config`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RepoConfig {
    #[serde(default)]
    pub datastore: DatastoreSpec,
    #[serde(default)]
    pub migration: Tuning,
}

/// How a repository's datastore is laid out on disk.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatastoreSpec {
    Sqlite {
        path: String,
    },
    Flatfs {
        path: String,
        #[serde(default)]
        shard: Shard,
    },
    Mount {
        mounts: Vec<MountSpec>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub prefix: String,
    pub child: DatastoreSpec,
}

impl Default for DatastoreSpec {
    /// Blocks in a flatfs directory, everything else in SQLite.
    fn default() -> Self {
        DatastoreSpec::Mount {
            mounts: vec![
                MountSpec {
                    prefix: "/blocks".to_string(),
                    child: DatastoreSpec::Flatfs {
                        path: "blocks".to_string(),
                        shard: Shard::default(),
                    },
                },
                MountSpec {
                    prefix: "/".to_string(),
                    child: DatastoreSpec::Sqlite {
                        path: "datastore/kv.sqlite".to_string(),
                    },
                },
            ],
        }
    }
}

impl DatastoreSpec {
    /// Short human-readable location used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            DatastoreSpec::Sqlite { path } => format!("sqlite:{path}"),
            DatastoreSpec::Flatfs { path, .. } => format!("flatfs:{path}"),
            DatastoreSpec::Mount { mounts } => {
                let parts: Vec<String> = mounts
                    .iter()
                    .map(|m| format!("{}={}", m.prefix, m.child.describe()))
                    .collect();
                format!("mount[{}]", parts.join(","))
            }
        }
    }
}

/// Pipeline sizing.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Tuning {
    /// Applies command-line overrides, clamping both sizes to at least one.
    pub fn with_overrides(self, workers: Option<usize>, queue_capacity: Option<usize>) -> Self {
        Self {
            workers: workers.unwrap_or(self.workers).max(1),
            queue_capacity: queue_capacity.unwrap_or(self.queue_capacity).max(1),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl RepoConfig {
    pub fn load(paths: &RepoPaths) -> Result<Self, MigrationError> {
        let path = paths.config_path();
        if !path.exists() {
            return Ok(RepoConfig::default());
        }
        let data = fs::read_to_string(&path).map_err(|e| MigrationError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| MigrationError::Config {
            path,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_uses_default_layout() {
        let temp = tempdir().unwrap();
        let config = RepoConfig::load(&RepoPaths::new(temp.path())).unwrap();
        assert_eq!(config.datastore, DatastoreSpec::default());
        assert_eq!(config.migration.queue_capacity, 1000);
        assert!(config.migration.workers >= 1);
    }

    #[test]
    fn test_parse_sqlite_config() {
        let temp = tempdir().unwrap();
        let paths = RepoPaths::new(temp.path());
        fs::write(
            paths.config_path(),
            r#"{
                "datastore": { "type": "sqlite", "path": "datastore/kv.sqlite" },
                "migration": { "workers": 3 }
            }"#,
        )
        .unwrap();

        let config = RepoConfig::load(&paths).unwrap();
        assert_eq!(
            config.datastore,
            DatastoreSpec::Sqlite {
                path: "datastore/kv.sqlite".to_string()
            }
        );
        assert_eq!(config.migration.workers, 3);
        assert_eq!(config.migration.queue_capacity, 1000);
    }

    #[test]
    fn test_parse_flatfs_shard() {
        let spec: DatastoreSpec =
            serde_json::from_str(r#"{ "type": "flatfs", "path": "blocks", "shard": { "prefix": 4 } }"#)
                .unwrap();
        assert_eq!(
            spec,
            DatastoreSpec::Flatfs {
                path: "blocks".to_string(),
                shard: Shard::Prefix(4)
            }
        );
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let temp = tempdir().unwrap();
        let paths = RepoPaths::new(temp.path());
        fs::write(paths.config_path(), "{ not json").unwrap();
        assert!(matches!(
            RepoConfig::load(&paths),
            Err(MigrationError::Config { .. })
        ));
    }

    #[test]
    fn test_overrides_clamp_to_one() {
        let tuning = Tuning::default().with_overrides(Some(0), Some(0));
        assert_eq!(tuning.workers, 1);
        assert_eq!(tuning.queue_capacity, 1);
    }
}
