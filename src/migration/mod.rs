//! Versioned repository migrations.
//!
//! This module handles:
//! - Declaring migration steps and the transforms each one performs
//! - Running a step forward (apply) or backward (revert) under the repo lock
//! - Recording re-keyed entries so a step can be undone exactly

pub mod backup;
pub mod blocks_to_flatfs;
pub mod cid_to_multihash;
pub mod manager;
pub mod pipeline;
pub mod step;
pub mod transfer;

use std::path::PathBuf;

use crate::config::{DatastoreSpec, Tuning};
use crate::error::MigrationError;
use crate::logger::Logger;

pub use manager::MigrationRegistry;
pub use step::{Direction, StepReport, Transform};

/// Everything a step needs to know about the repo it runs against.
#[derive(Debug, Clone)]
pub struct Options {
    pub root: PathBuf,
    pub datastore: DatastoreSpec,
    pub tuning: Tuning,
}

/// One versioned forward/backward transformation of a repo.
pub trait Migration: Send + Sync {
    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32;

    /// Step name, e.g. `8-to-9`.
    fn versions(&self) -> String {
        format!("{}-to-{}", self.from_version(), self.to_version())
    }

    fn reversible(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str;

    /// Transforms run in order on apply and in reverse order on revert.
    fn plan(&self) -> Vec<Transform>;

    fn apply(&self, opts: &Options, log: &Logger) -> Result<StepReport, MigrationError> {
        step::run(self, Direction::Apply, opts, log)
    }

    fn revert(&self, opts: &Options, log: &Logger) -> Result<StepReport, MigrationError> {
        step::run(self, Direction::Revert, opts, log)
    }
}
