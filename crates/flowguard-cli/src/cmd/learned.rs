use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use flowguard_core::state::Mutation;
use flowguard_core::store::StateStore;
use flowguard_core::{Settings, WorkflowState};
use std::path::Path;

#[derive(Subcommand)]
pub enum LearnedSubcommand {
    /// Show learned transition counts
    Show {
        /// Only transitions out of this command
        #[arg(long)]
        from: Option<String>,
    },
    /// Forget every learned transition
    Reset,
}

pub fn run(root: &Path, subcmd: LearnedSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        LearnedSubcommand::Show { from } => show(root, from.as_deref(), json),
        LearnedSubcommand::Reset => reset(root, json),
    }
}

fn show(root: &Path, from: Option<&str>, json: bool) -> anyhow::Result<()> {
    let state = WorkflowState::load(root).context("failed to load state")?;
    let rows: Vec<(&str, &str, u64)> = state
        .learned
        .iter()
        .filter(|(f, _, _)| from.map_or(true, |want| *f == want))
        .collect();

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(f, t, n)| serde_json::json!({ "from": f, "to": t, "count": n }))
            .collect();
        return print_json(&value);
    }
    if rows.is_empty() {
        println!("Nothing learned yet.");
        return Ok(());
    }
    let rows = rows
        .into_iter()
        .map(|(f, t, n)| vec![f.to_string(), t.to_string(), n.to_string()])
        .collect();
    print_table(&["FROM", "TO", "COUNT"], rows);
    Ok(())
}

fn reset(root: &Path, json: bool) -> anyhow::Result<()> {
    let settings = Settings::load(root);
    let state = WorkflowState::load(root).context("failed to load state")?;
    let pairs = state.learned.pair_count();

    let mut store = StateStore::new(state);
    store
        .commit(vec![Mutation::ResetLearned], &settings)
        .context("failed to reset learned transitions")?;
    store
        .snapshot()
        .save(root)
        .context("failed to write state.yaml")?;

    if json {
        print_json(&serde_json::json!({ "cleared": pairs }))?;
    } else {
        println!("Cleared {pairs} learned transition(s).");
    }
    Ok(())
}
