//! `stackyard stack create|delete|retry|update`

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use stackyard_orchestrator::{
    request_stack_create, request_stack_delete, request_stack_retry, request_stack_update,
};

use super::{home_dir, print_accepted};

#[derive(Subcommand, Debug)]
pub enum StackCommand {
    /// Request a new stack; provisioning continues in the daemon.
    Create(CreateArgs),
    /// Tear down a stack and every agent in it.
    Delete {
        /// Stack id.
        id: String,
    },
    /// Re-run creation for a failed stack.
    Retry {
        /// Stack id.
        id: String,
    },
    /// Rename a stack or change its description.
    Update(UpdateArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub name: String,

    #[arg(long, short = 'd')]
    pub description: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Stack id.
    pub id: String,

    #[arg(long, short = 'n')]
    pub name: Option<String>,

    #[arg(long, short = 'd')]
    pub description: Option<String>,
}

pub fn run(command: StackCommand) -> Result<()> {
    let home = home_dir()?;
    match command {
        StackCommand::Create(args) => {
            let unit = request_stack_create(&home, &args.name, args.description)
                .context("stack creation was not accepted")?;
            print_accepted("accepted", &unit);
        }
        StackCommand::Delete { id } => {
            let unit = request_stack_delete(&home, &id)
                .with_context(|| format!("deletion of stack {id} was not accepted"))?;
            print_accepted("deleting", &unit);
        }
        StackCommand::Retry { id } => {
            let unit = request_stack_retry(&home, &id)
                .with_context(|| format!("retry of stack {id} was not accepted"))?;
            print_accepted("retrying", &unit);
        }
        StackCommand::Update(args) => {
            if args.name.is_none() && args.description.is_none() {
                bail!("nothing to update: pass --name and/or --description");
            }
            let unit = request_stack_update(&home, &args.id, args.name, args.description)
                .with_context(|| format!("update of stack {} was not accepted", args.id))?;
            print_accepted("updated", &unit);
        }
    }
    Ok(())
}
