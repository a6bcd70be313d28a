//! `stackyard registry show|validate|repair`
//!
//! Works on the registry file directly; the daemon does not need to run.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use stackyard_core::Settings;
use stackyard_orchestrator::open_registry;
use stackyard_registry::{GraphRegistry, Validation};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum RegistryCommand {
    /// Print registered graphs.
    Show(ShowArgs),
    /// Check the file structure; exits non-zero when invalid.
    Validate,
    /// Replace a corrupt registry with an empty one.
    Repair,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "graph")]
    logical_id: String,
    #[tabled(rename = "code path")]
    code_path: String,
}

pub fn run(command: RegistryCommand) -> Result<()> {
    let home = home_dir()?;
    let settings = Settings::load_at(&home).context("failed to load settings")?;
    let registry = open_registry(&settings);

    match command {
        RegistryCommand::Show(args) => show(&registry, args.json),
        RegistryCommand::Validate => validate(&registry),
        RegistryCommand::Repair => repair(&registry),
    }
}

fn show(registry: &GraphRegistry, json: bool) -> Result<()> {
    let graphs = registry
        .read_consistent()
        .with_context(|| format!("failed to read {}", registry.path().display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&graphs).context("failed to serialize registry JSON")?
        );
        return Ok(());
    }

    println!("{} | {} graphs", registry.path().display(), graphs.len());
    if graphs.is_empty() {
        return Ok(());
    }
    let rows: Vec<GraphRow> = graphs
        .into_iter()
        .map(|(logical_id, code_path)| GraphRow {
            logical_id,
            code_path,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn validate(registry: &GraphRegistry) -> Result<()> {
    match registry.validate() {
        Validation::Valid => {
            println!("{} {}", "valid".green().bold(), registry.path().display());
            Ok(())
        }
        Validation::Invalid { reason } => {
            println!("{} {}: {reason}", "invalid".red().bold(), registry.path().display());
            bail!("registry {} is invalid", registry.path().display())
        }
    }
}

fn repair(registry: &GraphRegistry) -> Result<()> {
    let rewritten = registry
        .reset()
        .with_context(|| format!("failed to repair {}", registry.path().display()))?;
    if rewritten {
        println!("registry reset: {}", registry.path().display());
    } else {
        println!("registry is readable, nothing to repair: {}", registry.path().display());
    }
    Ok(())
}
