use std::ffi::OsStr;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::DatastoreSpec;
use crate::error::{KeyOp, MigrationError};
use crate::lock::RepoLock;
use crate::logger::Logger;
use crate::migration::backup::{BackupReader, BackupWriter};
use crate::migration::pipeline::{KeySwapper, ReplayStats};
use crate::migration::transfer::transfer;
use crate::migration::{Migration, Options};
use crate::store::{self, Datastore, Key};
use crate::version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Revert,
}

/// Lifecycle of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    Locked,
    VersionVerified,
    Transforming,
    VersionAdvanced,
    Done,
    Failed,
}

impl StepState {
    /// Successor on the success path.
    pub fn next(self) -> Option<StepState> {
        match self {
            StepState::NotStarted => Some(StepState::Locked),
            StepState::Locked => Some(StepState::VersionVerified),
            StepState::VersionVerified => Some(StepState::Transforming),
            StepState::Transforming => Some(StepState::VersionAdvanced),
            StepState::VersionAdvanced => Some(StepState::Done),
            StepState::Done | StepState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

struct Progress {
    state: StepState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: StepState::NotStarted,
        }
    }

    fn advance(&mut self, to: StepState) {
        debug_assert_eq!(self.state.next(), Some(to));
        debug!(from = ?self.state, to = ?to, "step state");
        self.state = to;
    }

    fn fail(&mut self, err: &MigrationError) {
        if self.state.is_terminal() {
            return;
        }
        debug!(from = ?self.state, to = ?StepState::Failed, error = %err, "step state");
        self.state = StepState::Failed;
    }
}

/// Re-key every entry under `namespace` and log the swaps to `backup_file`.
pub struct RekeySpec {
    pub namespace: &'static str,
    pub backup_file: &'static str,
    pub map: fn(&Key) -> Result<Key, MigrationError>,
}

/// Move a prefix out of one store into another. `remove_on_revert` names a
/// directory under the root that is deleted once revert has emptied it.
pub struct TransferSpec {
    pub source: DatastoreSpec,
    pub source_prefix: &'static str,
    pub target: DatastoreSpec,
    pub target_prefix: &'static str,
    pub remove_on_revert: Option<&'static str>,
}

/// Rename the repo root from `legacy` to `current` (its final path segment).
pub struct MoveRootSpec {
    pub legacy: &'static str,
    pub current: &'static str,
}

pub enum Transform {
    Rekey(RekeySpec),
    Transfer(TransferSpec),
    MoveRoot(MoveRootSpec),
}

/// What a step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub swapped: usize,
    pub transferred: usize,
    pub already_reverted: usize,
    pub skipped_lines: usize,
    /// Repo root after the step; differs from the input when the root moved.
    pub root: PathBuf,
}

/// Runs `step` in `direction`, holding the repo lock for the whole run.
pub fn run<M: Migration + ?Sized>(
    step: &M,
    direction: Direction,
    opts: &Options,
    log: &Logger,
) -> Result<StepReport, MigrationError> {
    let log = log.for_step(&step.versions());
    let mut progress = Progress::new();
    let result = drive(step, direction, opts, &log, &mut progress);
    match &result {
        Ok(_) => progress.advance(StepState::Done),
        Err(err) => progress.fail(err),
    }
    result
}

fn drive<M: Migration + ?Sized>(
    step: &M,
    direction: Direction,
    opts: &Options,
    log: &Logger,
    progress: &mut Progress,
) -> Result<StepReport, MigrationError> {
    if direction == Direction::Revert && !step.reversible() {
        return Err(MigrationError::NotReversible(step.versions()));
    }
    let (expected, target) = match direction {
        Direction::Apply => (step.from_version(), step.to_version()),
        Direction::Revert => (step.to_version(), step.from_version()),
    };

    let _lock = RepoLock::acquire(&opts.root)?;
    progress.advance(StepState::Locked);

    version::check_version(&opts.root, expected)?;
    progress.advance(StepState::VersionVerified);

    let mut plan = step.plan();
    if direction == Direction::Revert {
        plan.reverse();
    }
    check_root_moves(&plan, direction, &opts.root)?;

    progress.advance(StepState::Transforming);
    let mut report = StepReport {
        swapped: 0,
        transferred: 0,
        already_reverted: 0,
        skipped_lines: 0,
        root: opts.root.clone(),
    };
    let mut finished_backups = Vec::new();
    for transform in &plan {
        match (transform, direction) {
            (Transform::Rekey(spec), Direction::Apply) => {
                report.swapped += apply_rekey(spec, &report.root, opts, log)?;
            }
            (Transform::Rekey(spec), Direction::Revert) => {
                let (reader, stats, skipped) = revert_rekey(spec, &report.root, opts, log)?;
                report.swapped += stats.restored;
                report.already_reverted += stats.already_reverted;
                report.skipped_lines += skipped;
                finished_backups.push(reader);
            }
            (Transform::Transfer(spec), Direction::Apply) => {
                let from = open_store(&report.root, &spec.source)?;
                let to = open_store(&report.root, &spec.target)?;
                report.transferred += transfer(
                    from.as_ref(),
                    to.as_ref(),
                    spec.source_prefix,
                    spec.target_prefix,
                    log,
                )?;
            }
            (Transform::Transfer(spec), Direction::Revert) => {
                report.transferred += revert_transfer(spec, &report.root, log)?;
            }
            (Transform::MoveRoot(spec), _) => {
                let (from, to) = spec.names(direction);
                report.root = move_root(&report.root, from, to, log)?;
            }
        }
    }

    if let Err(err) = version::write_version(&report.root, target) {
        log.error(&format!(
            "data is already in the version {target} format but the version marker still reads {expected}; \
             fix the marker by hand before running another step"
        ));
        return Err(err);
    }
    progress.advance(StepState::VersionAdvanced);
    log.log(&format!("repo version is now {target}"));

    for reader in finished_backups {
        let path = reader.path().to_path_buf();
        if let Err(err) = reader.remove() {
            log.warn(&format!("could not remove {}: {err}", path.display()));
        }
    }
    Ok(report)
}

fn open_store(root: &Path, spec: &DatastoreSpec) -> Result<Box<dyn Datastore>, MigrationError> {
    store::open(root, spec).map_err(|source| MigrationError::StoreOpen {
        location: format!("{} in {}", spec.describe(), root.display()),
        source,
    })
}

fn apply_rekey(
    spec: &RekeySpec,
    root: &Path,
    opts: &Options,
    log: &Logger,
) -> Result<usize, MigrationError> {
    let store = open_store(root, &opts.datastore)?;
    let backup = BackupWriter::open(&root.join(spec.backup_file), log)?;
    let prefix = format!("{}/", spec.namespace.trim_end_matches('/'));
    let swapped = KeySwapper::new(store.as_ref(), opts.tuning, log).run(&prefix, spec.map, backup)?;
    store
        .sync()
        .map_err(|e| MigrationError::transform(&Key::new(spec.namespace), KeyOp::Put, e))?;
    log.log(&format!("re-keyed {swapped} entries under {}", spec.namespace));
    Ok(swapped)
}

fn revert_rekey(
    spec: &RekeySpec,
    root: &Path,
    opts: &Options,
    log: &Logger,
) -> Result<(BackupReader, ReplayStats, usize), MigrationError> {
    let reader = BackupReader::open(&root.join(spec.backup_file))?;
    let store = open_store(root, &opts.datastore)?;
    let swapper = KeySwapper::new(store.as_ref(), opts.tuning, log);
    let mut records = reader.records(log)?;
    let stats = swapper.restore(records.by_ref())?;
    let skipped = records.skipped();
    // Every old key is back before any new key goes away.
    store
        .sync()
        .map_err(|e| MigrationError::transform(&Key::new(spec.namespace), KeyOp::Put, e))?;
    swapper.remove_targets(reader.records(log)?.without_warnings())?;
    store
        .sync()
        .map_err(|e| MigrationError::transform(&Key::new(spec.namespace), KeyOp::Delete, e))?;

    if skipped > 0 {
        log.warn(&format!(
            "{skipped} malformed line(s) in {} were skipped",
            reader.path().display()
        ));
    }
    log.log(&format!("restored {} entries under {}", stats.restored, spec.namespace));
    Ok((reader, stats, skipped))
}

fn revert_transfer(spec: &TransferSpec, root: &Path, log: &Logger) -> Result<usize, MigrationError> {
    let moved = {
        let from = open_store(root, &spec.target)?;
        let to = open_store(root, &spec.source)?;
        transfer(
            from.as_ref(),
            to.as_ref(),
            spec.target_prefix_or_root(),
            spec.source_prefix,
            log,
        )?
    };
    if let Some(dir) = spec.remove_on_revert {
        let path = root.join(dir);
        match fs::remove_dir_all(&path) {
            Ok(()) => log.vlog(&format!("removed {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(MigrationError::Filesystem {
                    context: "cannot remove",
                    path,
                    source,
                });
            }
        }
    }
    Ok(moved)
}

impl TransferSpec {
    /// Query prefix for the target side; an empty prefix covers the whole store.
    fn target_prefix_or_root(&self) -> &'static str {
        if self.target_prefix.is_empty() {
            "/"
        } else {
            self.target_prefix
        }
    }
}

impl MoveRootSpec {
    /// `(from, to)` segment names for `direction`.
    fn names(&self, direction: Direction) -> (&'static str, &'static str) {
        match direction {
            Direction::Apply => (self.legacy, self.current),
            Direction::Revert => (self.current, self.legacy),
        }
    }
}

/// Makes sure every root move in `plan` can happen before any data is touched.
fn check_root_moves(
    plan: &[Transform],
    direction: Direction,
    root: &Path,
) -> Result<(), MigrationError> {
    let mut root = root.to_path_buf();
    for transform in plan {
        if let Transform::MoveRoot(spec) = transform {
            let (from, to) = spec.names(direction);
            if let Some(target) = root_move_target(&root, from, to)? {
                fs::create_dir(&target)
                    .and_then(|()| fs::remove_dir(&target))
                    .map_err(|source| MigrationError::Filesystem {
                        context: "cannot create repo root at",
                        path: target.clone(),
                        source,
                    })?;
                root = target;
            }
        }
    }
    Ok(())
}

/// Sibling path `root` would move to, or `None` when its last segment is not
/// `from`. Fails if the sibling already exists.
fn root_move_target(
    root: &Path,
    from: &str,
    to: &str,
) -> Result<Option<PathBuf>, MigrationError> {
    if root.file_name() != Some(OsStr::new(from)) {
        return Ok(None);
    }
    let target = root.with_file_name(to);
    if target.exists() {
        return Err(MigrationError::Filesystem {
            context: "cannot move repo root onto existing path",
            path: target,
            source: io::Error::from(ErrorKind::AlreadyExists),
        });
    }
    Ok(Some(target))
}

/// Renames `root` to a sibling called `to` when its last segment is `from`.
/// Any other root is left where it is.
fn move_root(root: &Path, from: &str, to: &str, log: &Logger) -> Result<PathBuf, MigrationError> {
    let Some(target) = root_move_target(root, from, to)? else {
        log.vlog(&format!(
            "repo root {} is not named {from}, not moving it",
            root.display()
        ));
        return Ok(root.to_path_buf());
    };
    fs::rename(root, &target).map_err(|source| MigrationError::Filesystem {
        context: "cannot move repo root to",
        path: target.clone(),
        source,
    })?;
    log.log(&format!("moved {} to {}", root.display(), target.display()));
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use tempfile::tempdir;

    struct Renamer {
        reversible: bool,
    }

    fn rename(key: &Key) -> Result<Key, MigrationError> {
        match key.name().strip_prefix("old-") {
            Some(rest) => Ok(key.parent().child(&format!("new-{rest}"))),
            None => Ok(key.clone()),
        }
    }

    impl Migration for Renamer {
        fn from_version(&self) -> u32 {
            3
        }
        fn to_version(&self) -> u32 {
            4
        }
        fn reversible(&self) -> bool {
            self.reversible
        }
        fn description(&self) -> &'static str {
            "test renamer"
        }
        fn plan(&self) -> Vec<Transform> {
            vec![Transform::Rekey(RekeySpec {
                namespace: "/ns",
                backup_file: "3-to-4-keys.txt",
                map: rename,
            })]
        }
    }

    fn repo(version: u32) -> (tempfile::TempDir, Options) {
        let temp = tempdir().unwrap();
        version::write_version(temp.path(), version).unwrap();
        let opts = Options {
            root: temp.path().to_path_buf(),
            datastore: DatastoreSpec::Sqlite {
                path: "kv.sqlite".to_string(),
            },
            tuning: Tuning {
                workers: 2,
                queue_capacity: 4,
            },
        };
        (temp, opts)
    }

    fn with_store<T>(opts: &Options, f: impl FnOnce(&dyn Datastore) -> T) -> T {
        let store = store::open(&opts.root, &opts.datastore).unwrap();
        f(store.as_ref())
    }

    #[test]
    fn test_state_order() {
        let mut state = StepState::NotStarted;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.last(), Some(&StepState::Done));
        assert_eq!(seen.len(), 6);
        assert!(StepState::Failed.is_terminal());
    }

    #[test]
    fn test_apply_then_revert() {
        let (_temp, opts) = repo(3);
        with_store(&opts, |store| {
            store.put(&Key::new("/ns/old-1"), b"one").unwrap();
            store.put(&Key::new("/ns/old-2"), b"two").unwrap();
        });
        let log = Logger::default();
        let step = Renamer { reversible: true };

        let report = step.apply(&opts, &log).unwrap();
        assert_eq!(report.swapped, 2);
        assert_eq!(version::read_version(&opts.root).unwrap(), 4);
        assert_eq!(
            fs::read_to_string(opts.root.join("3-to-4-keys.txt"))
                .unwrap()
                .lines()
                .count(),
            2
        );
        with_store(&opts, |store| {
            assert_eq!(store.get(&Key::new("/ns/new-1")).unwrap(), b"one");
            assert!(!store.has(&Key::new("/ns/old-1")).unwrap());
        });

        let report = step.revert(&opts, &log).unwrap();
        assert_eq!(report.swapped, 2);
        assert_eq!(version::read_version(&opts.root).unwrap(), 3);
        assert!(!opts.root.join("3-to-4-keys.txt").exists());
        with_store(&opts, |store| {
            assert_eq!(store.get(&Key::new("/ns/old-2")).unwrap(), b"two");
            assert!(!store.has(&Key::new("/ns/new-2")).unwrap());
        });
    }

    #[test]
    fn test_rerun_fails_at_version_check() {
        let (_temp, opts) = repo(3);
        let log = Logger::default();
        let step = Renamer { reversible: true };
        step.apply(&opts, &log).unwrap();

        match step.apply(&opts, &log) {
            Err(MigrationError::VersionMismatch { expected, found }) => {
                assert_eq!((expected, found), (3, 4));
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_revert_requires_reversible_step() {
        let (_temp, opts) = repo(4);
        let step = Renamer { reversible: false };
        assert!(matches!(
            step.revert(&opts, &Logger::default()),
            Err(MigrationError::NotReversible(name)) if name == "3-to-4"
        ));
    }

    #[test]
    fn test_locked_repo_is_refused() {
        let (_temp, opts) = repo(3);
        let _held = RepoLock::acquire(&opts.root).unwrap();
        let step = Renamer { reversible: true };
        assert!(matches!(
            step.apply(&opts, &Logger::default()),
            Err(MigrationError::Locked { .. })
        ));
        assert_eq!(version::read_version(&opts.root).unwrap(), 3);
    }

    #[test]
    fn test_failed_transform_keeps_version_and_releases_lock() {
        let (_temp, mut opts) = repo(3);
        // A flatfs store rejects the lowercase keys the rename produces.
        opts.datastore = DatastoreSpec::Mount {
            mounts: vec![
                crate::config::MountSpec {
                    prefix: "/ns".to_string(),
                    child: DatastoreSpec::Flatfs {
                        path: "flat".to_string(),
                        shard: Default::default(),
                    },
                },
                crate::config::MountSpec {
                    prefix: "/".to_string(),
                    child: DatastoreSpec::Sqlite {
                        path: "kv.sqlite".to_string(),
                    },
                },
            ],
        };
        let flat = crate::store::FlatfsStore::open(&opts.root.join("flat"), Default::default())
            .unwrap();
        flat.put(&Key::new("/OLD"), b"x").unwrap();
        drop(flat);

        struct Lowercaser;
        fn lower(key: &Key) -> Result<Key, MigrationError> {
            Ok(key.parent().child(&key.name().to_lowercase()))
        }
        impl Migration for Lowercaser {
            fn from_version(&self) -> u32 {
                3
            }
            fn to_version(&self) -> u32 {
                4
            }
            fn description(&self) -> &'static str {
                "lowercase"
            }
            fn plan(&self) -> Vec<Transform> {
                vec![Transform::Rekey(RekeySpec {
                    namespace: "/ns",
                    backup_file: "lower.txt",
                    map: lower,
                })]
            }
        }

        let err = Lowercaser.apply(&opts, &Logger::default()).unwrap_err();
        assert!(matches!(err, MigrationError::Transform { op: KeyOp::Put, .. }));
        assert_eq!(version::read_version(&opts.root).unwrap(), 3);
        RepoLock::acquire(&opts.root).unwrap();
    }

    #[test]
    fn test_move_root_only_moves_legacy_name() {
        let temp = tempdir().unwrap();
        let log = Logger::default();
        let other = temp.path().join("repo");
        fs::create_dir(&other).unwrap();
        assert_eq!(move_root(&other, "legacy", "current", &log).unwrap(), other);

        let legacy = temp.path().join("legacy");
        fs::create_dir(&legacy).unwrap();
        fs::write(legacy.join("version"), "1\n").unwrap();
        let moved = move_root(&legacy, "legacy", "current", &log).unwrap();
        assert_eq!(moved, temp.path().join("current"));
        assert!(moved.join("version").exists());
        assert!(!legacy.exists());
    }

    #[test]
    fn test_move_root_refuses_to_clobber() {
        let temp = tempdir().unwrap();
        let legacy = temp.path().join("legacy");
        fs::create_dir(&legacy).unwrap();
        fs::create_dir(temp.path().join("current")).unwrap();
        assert!(matches!(
            move_root(&legacy, "legacy", "current", &Logger::default()),
            Err(MigrationError::Filesystem { .. })
        ));
        assert!(legacy.exists());
    }
}
