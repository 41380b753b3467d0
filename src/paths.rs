use anyhow::{Result, anyhow};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

pub const VERSION_FILE: &str = "version";
pub const CONFIG_FILE: &str = "config";
pub const LOCK_FILE: &str = "repo.lock";

const DEFAULT_REPO_DIR: &str = ".keyshift";

/// Well-known artifacts under a repository root.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    pub root: PathBuf,
}

impl RepoPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Resolves the repo root from an explicit path (made absolute against the
    /// working directory) or falls back to `~/.keyshift`.
    pub fn resolve(repo: Option<&Path>) -> Result<Self> {
        let root = match repo {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => std::env::current_dir()?.join(path),
            None => {
                let base_dirs =
                    BaseDirs::new().ok_or_else(|| anyhow!("Unable to resolve home directory"))?;
                base_dirs.home_dir().join(DEFAULT_REPO_DIR)
            }
        };
        if !root.is_dir() {
            return Err(anyhow!("No repository found at {}", root.display()));
        }
        Ok(Self::new(&root))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }
}
