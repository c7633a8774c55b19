//! Background write-back of state snapshots.
//!
//! The bus hands every committed snapshot to a [`Persister`] and moves on.
//! A single-slot channel holds the newest snapshot only, so a burst of
//! commits collapses into one write. Failed writes are retried with
//! exponential backoff; a newer snapshot arriving during the backoff replaces
//! the one being retried, and a snapshot whose revision is not newer than the
//! last one written is dropped.

use crate::config::PersistenceConfig;
use crate::error::{GuardError, Result};
use crate::state::WorkflowState;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// StateSink
// ---------------------------------------------------------------------------

/// Durable storage for snapshots. Writes run on the blocking pool.
pub trait StateSink: Send + Sync + 'static {
    fn write(&self, state: &WorkflowState) -> Result<()>;
}

/// Writes `.flowguard/state.yaml` under a project root.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StateSink for FileSink {
    fn write(&self, state: &WorkflowState) -> Result<()> {
        state.save(&self.root)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(cfg: &PersistenceConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_delay_ms),
            cap: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

// ---------------------------------------------------------------------------
// PersistStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistStatus {
    /// Highest revision known to be on disk.
    pub last_written: Option<u64>,
    /// Revision currently being written or waiting for a retry.
    pub pending: Option<u64>,
    /// Failed attempts for the pending revision.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Highest revision given up on after exhausting retries.
    pub abandoned: Option<u64>,
}

impl PersistStatus {
    /// True once `revision` (or something newer) is written or given up on.
    pub fn settled(&self, revision: u64) -> bool {
        self.last_written.is_some_and(|w| w >= revision)
            || self.abandoned.is_some_and(|a| a >= revision)
    }

    /// Warning for the user when the last write failed.
    pub fn warning(&self) -> Option<String> {
        let err = self.last_error.as_ref()?;
        Some(match (self.pending, self.abandoned) {
            (Some(rev), _) => format!(
                "state not yet saved (revision {rev}, attempt {}): {err}; continuing from memory",
                self.attempts
            ),
            (None, Some(rev)) => {
                format!("gave up saving revision {rev}: {err}; in-memory state remains authoritative")
            }
            (None, None) => format!("state save failed: {err}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Persister
// ---------------------------------------------------------------------------

pub struct Persister {
    tx: watch::Sender<Option<Arc<WorkflowState>>>,
    status: watch::Receiver<PersistStatus>,
    submitted: Option<u64>,
    handle: JoinHandle<()>,
}

impl Persister {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn StateSink>, retry: RetryPolicy) -> Self {
        let (tx, rx) = watch::channel(None);
        let (status_tx, status) = watch::channel(PersistStatus::default());
        let handle = tokio::spawn(run(sink, retry, rx, status_tx));
        Self {
            tx,
            status,
            submitted: None,
            handle,
        }
    }

    /// Queue `snapshot` for writing. Never waits.
    pub fn submit(&mut self, snapshot: Arc<WorkflowState>) {
        self.submitted = Some(snapshot.revision);
        // Only fails when the writer task is gone.
        if self.tx.send(Some(snapshot)).is_err() {
            tracing::warn!("state writer has stopped; snapshot not persisted");
        }
    }

    pub fn status(&self) -> PersistStatus {
        self.status.borrow().clone()
    }

    /// Wait until the last submitted snapshot is written or abandoned.
    pub async fn flush(&mut self) -> PersistStatus {
        let Some(target) = self.submitted else {
            return self.status();
        };
        if let Ok(s) = self.status.wait_for(|s| s.settled(target)).await {
            return s.clone();
        }
        self.status()
    }

    /// Flush, then stop the writer task.
    pub async fn shutdown(mut self) -> PersistStatus {
        let status = self.flush().await;
        drop(self.tx);
        let _ = self.handle.await;
        status
    }
}

async fn run(
    sink: Arc<dyn StateSink>,
    retry: RetryPolicy,
    mut rx: watch::Receiver<Option<Arc<WorkflowState>>>,
    status_tx: watch::Sender<PersistStatus>,
) {
    let mut last_written: Option<u64> = None;

    while rx.changed().await.is_ok() {
        let Some(mut current) = rx.borrow_and_update().clone() else {
            continue;
        };
        let mut attempt = 0u32;

        loop {
            if last_written.is_some_and(|w| current.revision <= w) {
                tracing::debug!(revision = current.revision, "stale snapshot dropped");
                break;
            }
            attempt += 1;
            status_tx.send_modify(|s| s.pending = Some(current.revision));

            match write_once(&sink, &current).await {
                Ok(()) => {
                    tracing::debug!(revision = current.revision, "state saved");
                    last_written = Some(current.revision);
                    status_tx.send_modify(|s| {
                        s.last_written = last_written;
                        s.pending = None;
                        s.attempts = 0;
                        s.last_error = None;
                    });
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    tracing::warn!(
                        revision = current.revision,
                        attempt,
                        "state save failed: {msg}"
                    );
                    if attempt >= retry.max_attempts {
                        tracing::error!(
                            revision = current.revision,
                            "giving up after {attempt} attempts; in-memory state remains authoritative"
                        );
                        let rev = current.revision;
                        status_tx.send_modify(|s| {
                            s.pending = None;
                            s.attempts = attempt;
                            s.last_error = Some(msg);
                            s.abandoned = Some(rev);
                        });
                        break;
                    }
                    status_tx.send_modify(|s| {
                        s.attempts = attempt;
                        s.last_error = Some(msg);
                    });

                    let delay = retry.delay(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = rx.changed() => {
                            if changed.is_ok() {
                                if let Some(newer) = rx.borrow_and_update().clone() {
                                    if newer.revision > current.revision {
                                        tracing::debug!(
                                            from = current.revision,
                                            to = newer.revision,
                                            "retry superseded by newer snapshot"
                                        );
                                        current = newer;
                                        attempt = 0;
                                    }
                                }
                            } else {
                                // Submitter gone: finish retrying what we have.
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn write_once(sink: &Arc<dyn StateSink>, state: &Arc<WorkflowState>) -> Result<()> {
    let sink = Arc::clone(sink);
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || sink.write(&state))
        .await
        .map_err(|e| GuardError::Persistence(format!("writer task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
