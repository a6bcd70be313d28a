//! `stackyard agent create|delete|update`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use stackyard_orchestrator::{request_agent_create, request_agent_delete, request_agent_update};

use super::{home_dir, print_accepted};

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Upload a zipped agent into a stack.
    Create(CreateArgs),
    /// Unregister an agent and remove its code.
    Delete {
        /// Agent id.
        id: String,
    },
    /// Rename an agent or change its description.
    Update(UpdateArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Parent stack id.
    pub stack_id: String,

    pub name: String,

    /// Zip archive containing the agent's code.
    #[arg(long, short = 'a', value_name = "FILE")]
    pub archive: PathBuf,

    #[arg(long, short = 'd')]
    pub description: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Agent id.
    pub id: String,

    /// New name, unique within the agent's stack.
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    #[arg(long, short = 'd')]
    pub description: Option<String>,
}

pub fn run(command: AgentCommand) -> Result<()> {
    let home = home_dir()?;
    match command {
        AgentCommand::Create(args) => {
            // The daemon resolves paths itself, so hand it an absolute one.
            let archive = std::fs::canonicalize(&args.archive)
                .with_context(|| format!("cannot read archive {}", args.archive.display()))?;
            let unit = request_agent_create(
                &home,
                &args.stack_id,
                &args.name,
                args.description,
                &archive,
            )
            .context("agent creation was not accepted")?;
            print_accepted("accepted", &unit);
        }
        AgentCommand::Delete { id } => {
            let unit = request_agent_delete(&home, &id)
                .with_context(|| format!("deletion of agent {id} was not accepted"))?;
            print_accepted("deleting", &unit);
        }
        AgentCommand::Update(args) => {
            if args.name.is_none() && args.description.is_none() {
                bail!("nothing to update: pass --name and/or --description");
            }
            let unit = request_agent_update(&home, &args.id, args.name, args.description)
                .with_context(|| format!("update of agent {} was not accepted", args.id))?;
            print_accepted("updated", &unit);
        }
    }
    Ok(())
}
