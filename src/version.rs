use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::MigrationError;
use crate::paths::VERSION_FILE;

/// Reads the integer stored in `<root>/version`.
pub fn read_version(root: &Path) -> Result<u32, MigrationError> {
    let path = root.join(VERSION_FILE);
    let contents = fs::read_to_string(&path).map_err(|e| MigrationError::VersionRead {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|e| MigrationError::VersionRead {
            path,
            reason: format!("{:?} is not a version number: {e}", contents.trim()),
        })
}

/// Fails with [`MigrationError::VersionMismatch`] unless the repo is at `expected`.
pub fn check_version(root: &Path, expected: u32) -> Result<(), MigrationError> {
    let found = read_version(root)?;
    if found != expected {
        return Err(MigrationError::VersionMismatch { expected, found });
    }
    Ok(())
}

/// Replaces the version marker. The new contents land in a temp file next to
/// the marker and are renamed over it, so readers see the old or the new
/// version and never a partial write.
pub fn write_version(root: &Path, version: u32) -> Result<(), MigrationError> {
    let path = root.join(VERSION_FILE);
    let wrap = |source: io::Error| MigrationError::VersionWrite {
        path: path.clone(),
        source,
    };

    let mut temp = NamedTempFile::new_in(root).map_err(wrap)?;
    writeln!(temp, "{version}").map_err(wrap)?;
    temp.as_file().sync_all().map_err(wrap)?;
    temp.persist(&path).map_err(|e| wrap(e.error))?;
    sync_dir(root).map_err(wrap)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
