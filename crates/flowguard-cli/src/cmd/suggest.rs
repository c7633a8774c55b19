use crate::output::{print_json, print_table, score};
use chrono::{Local, Timelike};
use flowguard_core::EventBus;
use std::path::Path;

pub fn run(root: &Path, after: Option<&str>, hour: Option<u32>, json: bool) -> anyhow::Result<()> {
    if hour.is_some_and(|h| h > 23) {
        anyhow::bail!("--hour must be between 0 and 23");
    }
    let hour = hour.unwrap_or_else(|| Local::now().hour());
    let bus = EventBus::open(root);
    let suggestions = bus.suggest(after, hour);

    if json {
        return print_json(&suggestions);
    }
    let rows = suggestions
        .iter()
        .enumerate()
        .map(|(i, s)| {
            vec![
                (i + 1).to_string(),
                s.command.clone(),
                score(s.score),
                s.rationale.clone(),
            ]
        })
        .collect();
    print_table(&["#", "COMMAND", "SCORE", "WHY"], rows);
    Ok(())
}
