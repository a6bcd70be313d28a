//! stackyard: provisioning control plane for agent stacks.
//!
//! # Usage
//!
//! ```text
//! stackyard daemon start|stop|status
//! stackyard stack create <name> [--description <text>]
//! stackyard stack delete|retry <stack-id>
//! stackyard agent create <stack-id> <name> --archive <file.zip> [--description <text>]
//! stackyard agent delete <agent-id>
//! stackyard units [--json]
//! stackyard registry show [--json] | validate | repair
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    agent::AgentCommand, daemon::DaemonCommand, registry::RegistryCommand, stack::StackCommand,
    units::UnitsArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "stackyard",
    version,
    about = "Provision agent stacks and register their graphs",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or query the provisioning daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Create, delete or retry stacks.
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },

    /// Upload or delete agents within a stack.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// List stacks and agents with their lifecycle status.
    Units(UnitsArgs),

    /// Inspect or repair the graph registry file.
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Stack { command } => commands::stack::run(command),
        Commands::Agent { command } => commands::agent::run(command),
        Commands::Units(args) => args.run(),
        Commands::Registry { command } => commands::registry::run(command),
    }
}
