use anyhow::Context;
use flowguard_core::{io, paths, Settings, WorkflowState};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing flowguard in: {}", root.display());

    let dir = paths::guard_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config = Settings::default()
        .to_yaml()
        .context("failed to render default config")?;
    write_default(root, paths::CONFIG_FILE, &config)?;

    let state = WorkflowState::new()
        .to_yaml()
        .context("failed to render empty state")?;
    write_default(root, paths::STATE_FILE, &state)?;

    Ok(())
}

fn write_default(root: &Path, rel: &str, data: &str) -> anyhow::Result<()> {
    let path = root.join(rel);
    let written = io::write_if_missing(&path, data.as_bytes())
        .with_context(|| format!("failed to write {rel}"))?;
    if written {
        println!("  created: {rel}");
    } else {
        println!("  exists:  {rel}");
    }
    Ok(())
}
