use crate::error::MigrationError;
use crate::migration::Migration;
use crate::migration::blocks_to_flatfs::BlocksToFlatfs;
use crate::migration::cid_to_multihash::CidToMultihash;

/// Known migration steps, ordered by version.
pub struct MigrationRegistry {
    steps: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    /// Registry with every step shipped in this binary.
    pub fn builtin() -> Self {
        Self::new(vec![Box::new(BlocksToFlatfs), Box::new(CidToMultihash)])
    }

    pub fn new(mut steps: Vec<Box<dyn Migration>>) -> Self {
        steps.sort_by_key(|step| step.from_version());
        Self { steps }
    }

    pub fn steps(&self) -> impl Iterator<Item = &dyn Migration> {
        self.steps.iter().map(|step| step.as_ref())
    }

    /// Look up a step by name, e.g. `8-to-9`.
    pub fn find(&self, name: &str) -> Result<&dyn Migration, MigrationError> {
        self.steps()
            .find(|step| step.versions() == name)
            .ok_or_else(|| MigrationError::UnknownStep(name.to_string()))
    }

    /// The step that applies to a repo at `version`.
    pub fn starting_at(&self, version: u32) -> Result<&dyn Migration, MigrationError> {
        self.steps()
            .find(|step| step.from_version() == version)
            .ok_or(MigrationError::NoStepFor {
                direction: "from",
                version,
            })
    }

    /// The step a repo at `version` was last migrated by.
    pub fn ending_at(&self, version: u32) -> Result<&dyn Migration, MigrationError> {
        self.steps()
            .find(|step| step.to_version() == version)
            .ok_or(MigrationError::NoStepFor {
                direction: "to",
                version,
            })
    }
}
