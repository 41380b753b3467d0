use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::error::MigrationError;
use crate::logger::Logger;
use crate::store::Key;

/// Third field of a record whose `new` key was already in the store.
const KEPT_MARKER: &str = "kept";

/// One re-keyed entry: the value moved from `old` to `new`. `kept` is set when
/// `new` existed before the run, in which case revert must leave it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    pub old: Key,
    pub new: Key,
    pub kept: bool,
}

impl fmt::Display for Swap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.old, self.new)?;
        if self.kept {
            write!(f, ",{KEPT_MARKER}")?;
        }
        Ok(())
    }
}

/// Append-only writer for a step's backup artifact.
pub struct BackupWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl BackupWriter {
    /// Open the backup file for appending. An existing file is kept and
    /// extended, with a warning, so a rerun never loses earlier records.
    pub fn open(path: &Path, log: &Logger) -> Result<Self, MigrationError> {
        if path.exists() {
            log.warn(&format!(
                "backup file {} already exists, appending to it",
                path.display()
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| MigrationError::BackupOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write_record(&mut self, swap: &Swap) -> Result<(), MigrationError> {
        writeln!(self.out, "{swap}").map_err(|source| MigrationError::BackupWrite {
            path: self.path.clone(),
            source,
        })?;
        self.written += 1;
        Ok(())
    }

    /// Flush and fsync; returns how many records this writer appended.
    pub fn finish(self) -> Result<usize, MigrationError> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| MigrationError::BackupWrite {
                path: path.clone(),
                source: e.into_error(),
            })?;
        file.sync_all()
            .map_err(|source| MigrationError::BackupWrite { path, source })?;
        Ok(self.written)
    }
}

/// Read side of a backup artifact, used by revert.
#[derive(Debug)]
pub struct BackupReader {
    path: PathBuf,
}

impl BackupReader {
    /// Fails fast if the artifact cannot be opened.
    pub fn open(path: &Path) -> Result<Self, MigrationError> {
        File::open(path).map_err(|source| MigrationError::BackupOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh pass over the records. Every call reopens the file, so the
    /// sequence can be restarted from the top.
    pub fn records(&self, log: &Logger) -> Result<BackupRecords, MigrationError> {
        let file = File::open(&self.path).map_err(|source| MigrationError::BackupOpen {
            path: self.path.clone(),
            source,
        })?;
        Ok(BackupRecords {
            path: self.path.clone(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
            skipped: 0,
            failed: false,
            warn: true,
            log: log.clone(),
        })
    }

    /// Delete the artifact once a revert has fully succeeded.
    pub fn remove(self) -> Result<(), MigrationError> {
        fs::remove_file(&self.path).map_err(|source| MigrationError::Filesystem {
            context: "cannot remove backup file",
            path: self.path,
            source,
        })
    }
}

/// Lazy iterator over `old,new[,kept]` lines. Malformed lines are skipped with
/// a warning and counted; an I/O error yields one `Err` and ends the sequence.
pub struct BackupRecords {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    skipped: usize,
    failed: bool,
    warn: bool,
    log: Logger,
}

impl BackupRecords {
    /// Malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Still skips malformed lines but does not warn again about them.
    pub fn without_warnings(mut self) -> Self {
        self.warn = false;
        self
    }
}

fn parse_line(line: &str) -> Option<Swap> {
    let mut fields = line.split(',');
    let old = fields.next()?;
    let new = fields.next()?;
    let kept = match fields.next() {
        None => false,
        Some(KEPT_MARKER) => true,
        Some(_) => return None,
    };
    if fields.next().is_some() || old.is_empty() || new.is_empty() {
        return None;
    }
    Some(Swap {
        old: Key::new(old),
        new: Key::new(new),
        kept,
    })
}

impl Iterator for BackupRecords {
    type Item = Result<Swap, MigrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    self.failed = true;
                    return Some(Err(MigrationError::BackupRead {
                        path: self.path.clone(),
                        source,
                    }));
                }
            };
            self.line_no += 1;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(swap) => return Some(Ok(swap)),
                None => {
                    self.skipped += 1;
                    if self.warn {
                        self.log.warn(&format!(
                            "skipping malformed line {} in {}: {line:?}",
                            self.line_no,
                            self.path.display()
                        ));
                    }
                }
            }
        }
    }
}
