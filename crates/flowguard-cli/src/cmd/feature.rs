use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use flowguard_core::types::FeatureStatus;
use flowguard_core::WorkflowState;
use std::path::Path;

#[derive(Subcommand)]
pub enum FeatureSubcommand {
    /// List features
    List {
        /// Only features with this status (planned, active, blocked, completed, archived)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one feature with its history and files
    Show { id: String },
}

pub fn run(root: &Path, subcmd: FeatureSubcommand, json: bool) -> anyhow::Result<()> {
    let state = WorkflowState::load(root).context("failed to load state")?;
    match subcmd {
        FeatureSubcommand::List { status } => list(&state, status.as_deref(), json),
        FeatureSubcommand::Show { id } => show(&state, &id, json),
    }
}

fn list(state: &WorkflowState, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let features: Vec<_> = state
        .features
        .values()
        .filter(|f| status.map_or(true, |s| f.status.as_str() == s))
        .collect();

    if json {
        return print_json(&features);
    }
    if features.is_empty() {
        println!("No features.");
        return Ok(());
    }
    let rows = features
        .iter()
        .map(|f| {
            let marker = if state.active_feature.as_deref() == Some(f.id.as_str()) {
                "*"
            } else {
                ""
            };
            vec![
                format!("{marker}{}", f.id),
                f.status.to_string(),
                format!("{:.0}%", state.completion_ratio(&f.id) * 100.0),
                f.linked_issue.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["FEATURE", "STATUS", "DONE", "ISSUE"], rows);
    Ok(())
}

fn show(state: &WorkflowState, id: &str, json: bool) -> anyhow::Result<()> {
    let feature = state
        .feature(id)
        .with_context(|| format!("feature '{id}' not found"))?;

    if json {
        let value = serde_json::json!({
            "feature": feature,
            "ledger": state.ledger_for(id),
            "completion_ratio": state.completion_ratio(id),
            "completion_blockers": state.completion_blockers(id),
        });
        return print_json(&value);
    }

    println!("Feature: {}", feature.id);
    println!("Status:  {}", feature.status);
    if feature.status == FeatureStatus::Blocked {
        if let Some(reason) = &feature.blocked_reason {
            println!("Reason:  {reason}");
        }
    }
    println!("Branch:  {}", feature.branch_name);
    if let Some(issue) = &feature.linked_issue {
        println!("Issue:   {issue}");
    }
    if let Some(test_ref) = &feature.test_ref {
        let outcome = state
            .test_outcome(test_ref)
            .map(|o| o.to_string())
            .unwrap_or_else(|| "not run".to_string());
        println!("Tests:   {test_ref} ({outcome})");
    }
    if let Some(ledger) = state.ledger_for(id) {
        println!("Tasks:   {}", ledger.summarize());
    }

    let blockers = state.completion_blockers(id);
    if feature.status == FeatureStatus::Active && !blockers.is_empty() {
        println!("\nBefore completing:");
        for b in &blockers {
            println!("  - {b}");
        }
    }

    if !feature.files_touched.is_empty() {
        println!("\nFiles:");
        for f in &feature.files_touched {
            println!("  {f}");
        }
    }

    if !feature.history.is_empty() {
        println!("\nHistory:");
        for h in &feature.history {
            let reason = h
                .reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            println!(
                "  {}  {} -> {}{reason}",
                h.at.format("%Y-%m-%d %H:%M"),
                h.from,
                h.to
            );
        }
    }
    Ok(())
}
