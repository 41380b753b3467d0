use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "keyshift",
    version,
    about = "Upgrade or downgrade a content-addressed repository one schema version at a time."
)]
pub struct Cli {
    /// Repository root (defaults to ~/.keyshift)
    #[arg(long, global = true, env = "KEYSHIFT_PATH", value_name = "PATH")]
    pub repo: Option<PathBuf>,
    /// Log every key as it moves
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Worker threads for re-keying (overrides the repo config)
    #[arg(long, global = true, value_name = "N")]
    pub workers: Option<usize>,
    /// Backup queue capacity (overrides the repo config)
    #[arg(long, global = true, value_name = "N")]
    pub queue_capacity: Option<usize>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a migration step forward
    Apply(StepArgs),
    /// Undo a migration step
    Revert(StepArgs),
    /// Print the repo version
    Version,
    /// List the migration steps this binary knows
    List,
}

#[derive(Args)]
pub struct StepArgs {
    /// Step name such as 8-to-9; chosen from the repo version when omitted
    #[arg(value_name = "STEP")]
    pub step: Option<String>,
}
