//! `stackyard units`: stacks and their agents, read straight from the status store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use stackyard_core::{FileStatusStore, StatusStore, Unit, UnitKind, UnitStatus};

use super::home_dir;

/// Arguments for `stackyard units`.
#[derive(Args, Debug)]
pub struct UnitsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "unit")]
    name: String,
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "updated")]
    updated: String,
    #[tabled(rename = "endpoint")]
    endpoint: String,
}

impl UnitsArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let store = FileStatusStore::at_home(&home);
        let units = order_units(store.list().context("failed to read status store")?);

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&units).context("failed to serialize units JSON")?
            );
            return Ok(());
        }

        print_table(&units);
        Ok(())
    }
}

/// Stacks oldest first, each followed by its agents.
fn order_units(units: Vec<Unit>) -> Vec<Unit> {
    let (mut stacks, agents): (Vec<Unit>, Vec<Unit>) =
        units.into_iter().partition(|u| u.kind == UnitKind::Stack);
    stacks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));

    let mut ordered = Vec::with_capacity(stacks.len() + agents.len());
    let mut orphans: Vec<Unit> = agents
        .iter()
        .filter(|agent| !stacks.iter().any(|s| Some(s.id) == agent.parent_id))
        .cloned()
        .collect();
    for stack in stacks {
        let mut children: Vec<Unit> = agents
            .iter()
            .filter(|agent| agent.parent_id == Some(stack.id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        ordered.push(stack);
        ordered.extend(children);
    }
    orphans.sort_by(|a, b| a.name.cmp(&b.name));
    ordered.extend(orphans);
    ordered
}

fn print_table(units: &[Unit]) {
    let stacks = units.iter().filter(|u| u.kind == UnitKind::Stack).count();
    let failed = units.iter().filter(|u| u.status == UnitStatus::Failed).count();
    println!(
        "stackyard v{} | {} stacks | {} agents | {} failed",
        env!("CARGO_PKG_VERSION"),
        stacks,
        units.len() - stacks,
        failed,
    );

    if units.is_empty() {
        println!("No stacks yet.");
        println!("Run: stackyard stack create <name>");
        return;
    }

    let now = Utc::now();
    let rows: Vec<UnitRow> = units
        .iter()
        .map(|unit| UnitRow {
            name: match unit.kind {
                UnitKind::Stack => unit.name.bold().to_string(),
                UnitKind::Agent => format!("  └ {}", unit.name),
            },
            id: unit.id.to_string(),
            status: status_label(unit.status),
            updated: format_age(unit.updated_at, now),
            endpoint: endpoint(unit),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn endpoint(unit: &Unit) -> String {
    match unit.kind {
        UnitKind::Stack => unit.refs.namespace.clone().unwrap_or_default(),
        UnitKind::Agent => unit.refs.ui_url.clone().unwrap_or_default(),
    }
}

fn status_label(status: UnitStatus) -> String {
    let label = status.to_string().to_uppercase();
    match status {
        UnitStatus::Ready => label.green().bold().to_string(),
        UnitStatus::Failed => label.red().bold().to_string(),
        UnitStatus::Creating | UnitStatus::Deleting => label.yellow().to_string(),
    }
}

fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - at).num_seconds().max(0);
    match seconds {
        0..=59 => format!("{seconds}s ago"),
        60..=3599 => format!("{}m ago", seconds / 60),
        3600..=86_399 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn agents_follow_their_stack() {
        let first = Unit::new_stack("alpha", None);
        let mut second = Unit::new_stack("beta", None);
        second.created_at = first.created_at + Duration::seconds(1);
        let agent_b = Unit::new_agent(second.id, "zeta", None);
        let agent_a = Unit::new_agent(first.id, "support", None);

        let ordered = order_units(vec![agent_b, second, agent_a, first]);
        let names: Vec<&str> = ordered.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["alpha", "support", "beta", "zeta"]);
    }

    #[test]
    fn ages_are_coarse() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::seconds(5), now), "5s ago");
        assert_eq!(format_age(now - Duration::minutes(3), now), "3m ago");
        assert_eq!(format_age(now - Duration::hours(2), now), "2h ago");
        assert_eq!(format_age(now - Duration::days(4), now), "4d ago");
        assert_eq!(format_age(now + Duration::seconds(5), now), "0s ago");
    }
}
