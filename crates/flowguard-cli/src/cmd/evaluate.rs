use crate::output::print_json;
use anyhow::Context;
use flowguard_core::{paths, EventBus, Phase, ToolInvocation};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Longest we wait for the state file to be written before exiting.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one invocation through the event bus and return the process exit code
/// for its verdict.
pub fn run(root: &Path, phase: &str, invocation: &Path, json: bool) -> anyhow::Result<i32> {
    let phase: Phase = phase.parse().context("invalid --phase")?;
    let data = read_input(invocation)?;
    let mut inv = ToolInvocation::from_json(&data).context("invalid invocation JSON")?;
    inv.phase = Some(phase);

    let initialized = paths::guard_dir(root).is_dir();
    if !initialized {
        tracing::debug!("no .flowguard directory; evaluating without saving state");
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let outcome = rt.block_on(async {
        let mut bus = EventBus::open(root);
        if initialized {
            bus = bus.persist_to_disk();
        }
        let outcome = bus.dispatch(phase, inv).await;
        match tokio::time::timeout(FLUSH_TIMEOUT, bus.shutdown()).await {
            Ok(Some(status)) => {
                if let Some(w) = status.warning() {
                    tracing::warn!("{w}");
                }
            }
            Ok(None) => {}
            Err(_) => tracing::warn!("state save still pending after {FLUSH_TIMEOUT:?}"),
        }
        outcome
    });

    if json || phase != Phase::Pre {
        print_json(&outcome)?;
    } else {
        print_json(&outcome.response())?;
    }
    Ok(outcome.verdict.exit_code())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read invocation from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read invocation from {}", path.display()))
}
