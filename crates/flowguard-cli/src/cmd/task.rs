use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use flowguard_core::WorkflowState;
use std::path::Path;

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// List tasks for a feature (default: the active feature)
    List { feature: Option<String> },
}

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::List { feature } => list(root, feature.as_deref(), json),
    }
}

fn list(root: &Path, feature: Option<&str>, json: bool) -> anyhow::Result<()> {
    let state = WorkflowState::load(root).context("failed to load state")?;
    let id = state
        .resolve_feature(feature)
        .context("no feature given and none is active")?;
    let ledger = state
        .ledger_for(&id)
        .with_context(|| format!("no task ledger for '{id}'"))?;

    if json {
        return print_json(ledger);
    }
    if ledger.tasks.is_empty() {
        println!("No tasks for '{id}'.");
        return Ok(());
    }
    let rows = ledger
        .tasks
        .iter()
        .map(|t| {
            let test = match &t.test_ref {
                Some(r) => {
                    let outcome = state
                        .test_outcome(r)
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| "not run".to_string());
                    format!("{r} ({outcome})")
                }
                None => String::new(),
            };
            vec![t.id.clone(), t.status.to_string(), t.description.clone(), test]
        })
        .collect();
    print_table(&["ID", "STATUS", "DESCRIPTION", "TEST"], rows);
    println!("\n{}", ledger.summarize());
    if let Some(next) = ledger.next_task() {
        println!("Next: {} {}", next.id, next.description);
    }
    Ok(())
}
