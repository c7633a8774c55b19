use crate::output::{print_json, print_table};
use anyhow::Context;
use flowguard_core::WorkflowState;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = WorkflowState::load(root).context("failed to load state")?;

    if json {
        return print_json(&state);
    }

    println!("Revision: {}", state.revision);
    println!(
        "Active:   {}",
        state.active_feature.as_deref().unwrap_or("(none)")
    );

    let session = &state.session;
    match session.started_at {
        Some(started) => {
            let status = if session.ended_at.is_some() {
                "ended"
            } else {
                "open"
            };
            println!(
                "Session:  {status}, started {}, {} recent call(s)",
                started.format("%Y-%m-%d %H:%M UTC"),
                session.recent.len()
            );
        }
        None => println!("Session:  (none yet)"),
    }
    if let Some(last) = session.last_command() {
        println!("Last:     {last}");
    }

    if state.features.is_empty() {
        println!("\nNo features.");
        return Ok(());
    }

    println!();
    let rows = state
        .features
        .values()
        .map(|f| {
            let tasks = state
                .ledger_for(&f.id)
                .map(|l| l.summarize())
                .unwrap_or_default();
            vec![f.id.clone(), f.status.to_string(), f.branch_name.clone(), tasks]
        })
        .collect();
    print_table(&["FEATURE", "STATUS", "BRANCH", "TASKS"], rows);
    Ok(())
}
