mod cid;
mod cli;
mod config;
mod error;
mod formatting;
mod lock;
mod logger;
mod migration;
mod paths;
mod sanitize;
mod store;
mod version;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

use crate::cli::{Cli, Commands, StepArgs};
use crate::config::RepoConfig;
use crate::logger::Logger;
use crate::migration::{MigrationRegistry, Options, StepReport};
use crate::paths::RepoPaths;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let Cli {
        repo,
        verbose,
        workers,
        queue_capacity,
        command,
    } = Cli::parse();
    logger::init(verbose);
    let log = Logger::new(verbose);

    match command {
        Commands::Apply(args) => {
            let opts = step_options(repo.as_deref(), workers, queue_capacity)?;
            cmd_apply(&opts, args, &log)
        }
        Commands::Revert(args) => {
            let opts = step_options(repo.as_deref(), workers, queue_capacity)?;
            cmd_revert(&opts, args, &log)
        }
        Commands::Version => cmd_version(repo.as_deref()),
        Commands::List => cmd_list(repo.as_deref()),
    }
}

fn step_options(
    repo: Option<&Path>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
) -> Result<Options> {
    let paths = RepoPaths::resolve(repo)?;
    let config = RepoConfig::load(&paths)?;
    Ok(Options {
        root: paths.root,
        datastore: config.datastore,
        tuning: config.migration.with_overrides(workers, queue_capacity),
    })
}

fn cmd_apply(opts: &Options, args: StepArgs, log: &Logger) -> Result<()> {
    let registry = MigrationRegistry::builtin();
    let step = match args.step {
        Some(name) => registry.find(&name)?,
        None => registry.starting_at(version::read_version(&opts.root)?)?,
    };
    let report = step
        .apply(opts, log)
        .with_context(|| format!("{} apply failed", step.versions()))?;

    println!(
        "✅ Applied {}: repo is now at version {}",
        step.versions(),
        step.to_version()
    );
    print_counts(&report, "re-keyed");
    print_moved_root(opts, &report);
    Ok(())
}

fn cmd_revert(opts: &Options, args: StepArgs, log: &Logger) -> Result<()> {
    let registry = MigrationRegistry::builtin();
    let step = match args.step {
        Some(name) => registry.find(&name)?,
        None => registry.ending_at(version::read_version(&opts.root)?)?,
    };
    let report = step
        .revert(opts, log)
        .with_context(|| format!("{} revert failed", step.versions()))?;

    println!(
        "✅ Reverted {}: repo is now at version {}",
        step.versions(),
        step.from_version()
    );
    print_counts(&report, "restored");
    if report.already_reverted > 0 {
        println!(
            "   {} entries were already restored",
            report.already_reverted
        );
    }
    if report.skipped_lines > 0 {
        println!(
            "⚠️  {} malformed backup line(s) were skipped",
            report.skipped_lines
        );
    }
    print_moved_root(opts, &report);
    Ok(())
}

fn print_counts(report: &StepReport, verb: &str) {
    if report.swapped > 0 {
        println!("   {} key(s) {verb}", report.swapped);
    }
    if report.transferred > 0 {
        println!("   {} entries transferred", report.transferred);
    }
}

fn print_moved_root(opts: &Options, report: &StepReport) {
    if report.root != opts.root {
        println!("   Repo moved to {}", report.root.display());
    }
}

fn cmd_version(repo: Option<&Path>) -> Result<()> {
    let paths = RepoPaths::resolve(repo)?;
    let current = version::read_version(&paths.root)?;
    println!("{current}");
    Ok(())
}

fn cmd_list(repo: Option<&Path>) -> Result<()> {
    let registry = MigrationRegistry::builtin();
    // Listing works without a repo; the marker only highlights the next step.
    let current = RepoPaths::resolve(repo)
        .ok()
        .and_then(|paths| version::read_version(&paths.root).ok());
    println!("{}", formatting::format_steps_table(registry.steps(), current));
    Ok(())
}
