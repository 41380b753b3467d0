//! Version 1 kept blocks inside the SQLite datastore under `/b/`. Version 2
//! stores them one file per block in a flatfs directory and uses the
//! `.keyshift` root name instead of `.keyshift-legacy`.

use crate::config::DatastoreSpec;
use crate::migration::Migration;
use crate::migration::step::{MoveRootSpec, Transform, TransferSpec};
use crate::store::flatfs::Shard;

pub const LEGACY_DATASTORE: &str = "datastore/kv.sqlite";
pub const LEGACY_BLOCK_PREFIX: &str = "/b/";
pub const BLOCKS_DIR: &str = "blocks";
pub const LEGACY_ROOT_NAME: &str = ".keyshift-legacy";
pub const ROOT_NAME: &str = ".keyshift";

pub struct BlocksToFlatfs;

impl Migration for BlocksToFlatfs {
    fn from_version(&self) -> u32 {
        1
    }

    fn to_version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "move blocks from the sqlite datastore into a flatfs directory"
    }

    fn plan(&self) -> Vec<Transform> {
        vec![
            Transform::Transfer(TransferSpec {
                source: DatastoreSpec::Sqlite {
                    path: LEGACY_DATASTORE.to_string(),
                },
                source_prefix: LEGACY_BLOCK_PREFIX,
                target: DatastoreSpec::Flatfs {
                    path: BLOCKS_DIR.to_string(),
                    shard: Shard::default(),
                },
                target_prefix: "",
                remove_on_revert: Some(BLOCKS_DIR),
            }),
            Transform::MoveRoot(MoveRootSpec {
                legacy: LEGACY_ROOT_NAME,
                current: ROOT_NAME,
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::logger::Logger;
    use crate::migration::Options;
    use crate::store::{Datastore, FlatfsStore, Key, SqliteStore};
    use crate::version;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const BLOCKS: [&str; 5] = ["CIQAAAA", "CIQBBBB", "CIQCCCC", "CIQDDDD", "CIQEEEE"];

    fn legacy_repo(root: &Path) {
        fs::create_dir_all(root).unwrap();
        version::write_version(root, 1).unwrap();
        let sqlite = SqliteStore::open(&root.join(LEGACY_DATASTORE)).unwrap();
        for name in BLOCKS {
            sqlite
                .put(&Key::new(format!("/b/{name}")), name.as_bytes())
                .unwrap();
        }
        sqlite.put(&Key::new("/local/filesroot"), b"root").unwrap();
    }

    fn options(root: &Path) -> Options {
        Options {
            root: root.to_path_buf(),
            datastore: DatastoreSpec::default(),
            tuning: Tuning::default(),
        }
    }

    #[test]
    fn test_apply_moves_blocks_and_root() {
        let temp = tempdir().unwrap();
        let legacy = temp.path().join(LEGACY_ROOT_NAME);
        legacy_repo(&legacy);

        let report = BlocksToFlatfs
            .apply(&options(&legacy), &Logger::default())
            .unwrap();

        let current = temp.path().join(ROOT_NAME);
        assert_eq!(report.transferred, 5);
        assert_eq!(report.root, current);
        assert!(!legacy.exists());
        assert_eq!(version::read_version(&current).unwrap(), 2);

        let flatfs = FlatfsStore::open(&current.join(BLOCKS_DIR), Shard::default()).unwrap();
        assert_eq!(flatfs.query("/").unwrap().len(), 5);
        assert_eq!(flatfs.get(&Key::new("/CIQCCCC")).unwrap(), b"CIQCCCC");

        let sqlite = SqliteStore::open(&current.join(LEGACY_DATASTORE)).unwrap();
        assert!(sqlite.query("/b/").unwrap().is_empty());
        assert!(sqlite.has(&Key::new("/local/filesroot")).unwrap());
    }

    #[test]
    fn test_revert_restores_legacy_layout() {
        let temp = tempdir().unwrap();
        let legacy = temp.path().join(LEGACY_ROOT_NAME);
        legacy_repo(&legacy);
        let log = Logger::default();

        let applied = BlocksToFlatfs.apply(&options(&legacy), &log).unwrap();
        let reverted = BlocksToFlatfs
            .revert(&options(&applied.root), &log)
            .unwrap();

        assert_eq!(reverted.root, legacy);
        assert_eq!(reverted.transferred, 5);
        assert!(!temp.path().join(ROOT_NAME).exists());
        assert!(!legacy.join(BLOCKS_DIR).exists());
        assert_eq!(version::read_version(&legacy).unwrap(), 1);

        let sqlite = SqliteStore::open(&legacy.join(LEGACY_DATASTORE)).unwrap();
        let keys = sqlite.query("/b/").unwrap();
        assert_eq!(keys.len(), 5);
        assert_eq!(sqlite.get(&Key::new("/b/CIQAAAA")).unwrap(), b"CIQAAAA");
    }

    #[test]
    fn test_blocked_root_move_fails_before_blocks_move() {
        let temp = tempdir().unwrap();
        let legacy = temp.path().join(LEGACY_ROOT_NAME);
        legacy_repo(&legacy);
        fs::create_dir(temp.path().join(ROOT_NAME)).unwrap();

        let err = BlocksToFlatfs
            .apply(&options(&legacy), &Logger::default())
            .unwrap_err();

        assert!(matches!(err, crate::error::MigrationError::Filesystem { .. }));
        assert_eq!(version::read_version(&legacy).unwrap(), 1);
        assert!(!legacy.join(BLOCKS_DIR).exists());
        let sqlite = SqliteStore::open(&legacy.join(LEGACY_DATASTORE)).unwrap();
        assert_eq!(sqlite.query("/b/").unwrap().len(), BLOCKS.len());
    }

    #[test]
    fn test_root_with_other_name_stays_put() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("repo");
        legacy_repo(&root);

        let report = BlocksToFlatfs
            .apply(&options(&root), &Logger::default())
            .unwrap();

        assert_eq!(report.root, root);
        assert_eq!(version::read_version(&root).unwrap(), 2);
    }
}
