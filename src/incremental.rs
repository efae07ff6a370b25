//! Checkpointed incremental processing
//!
//! Comments are processed in sequential slices. The checkpoint is saved after
//! every slice, before the next one starts, and on every error path, so an
//! interruption loses at most one slice of work.

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::review::{CommentContext, TaskCandidate};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IncrementalOptions {
    pub batch_size: usize,
    /// Stop after this many slices in one run, keeping the checkpoint.
    pub max_batches: Option<usize>,
    /// Deadline for the whole run.
    pub timeout: Duration,
    pub resume: bool,
    pub max_checkpoint_age: chrono::Duration,
}

impl IncrementalOptions {
    pub fn from_settings(ai: &crate::config::AiSettings, max_age: chrono::Duration) -> Self {
        Self {
            batch_size: ai.batch_size,
            max_batches: ai.max_batches,
            timeout: Duration::from_secs(ai.timeout_secs),
            resume: true,
            max_checkpoint_age: max_age,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every comment processed; checkpoint deleted.
    Completed,
    /// The slice ceiling stopped the run; checkpoint kept.
    BatchLimit,
    /// Some comments failed in this run; checkpoint kept for the next one.
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct IncrementalOutcome {
    pub status: RunStatus,
    /// Every candidate accumulated in the checkpoint, including earlier runs.
    pub candidates: Vec<TaskCandidate>,
    /// Comment ids whose tasks are in `candidates`.
    pub processed_ids: HashSet<i64>,
    pub processed: usize,
    pub total: usize,
    pub batches_run: usize,
    pub failed: Vec<i64>,
    pub resumed: bool,
}

impl IncrementalOutcome {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}

/// Run the slice loop for one PR.
///
/// Errors are `PipelineError` values wrapped in `anyhow`; the checkpoint has
/// been saved before any of them is returned.
pub async fn run_incremental(
    pr_number: u64,
    contexts: &[CommentContext],
    dispatcher: &Dispatcher<'_>,
    store: &dyn CheckpointStore,
    options: &IncrementalOptions,
) -> anyhow::Result<IncrementalOutcome> {
    let total = contexts.len();
    let (mut state, resumed) = init_state(pr_number, contexts, store, options)?;
    let deadline = Instant::now() + options.timeout;
    let batch_size = options.batch_size.max(1);

    let mut attempted: HashSet<i64> = HashSet::new();
    let mut failed: Vec<i64> = Vec::new();
    let mut batches_run = 0usize;

    let status = loop {
        let pending: Vec<&CommentContext> = contexts
            .iter()
            .filter(|ctx| !state.is_processed(ctx) && !attempted.contains(&ctx.comment_id()))
            .collect();

        if pending.is_empty() {
            break if failed.is_empty() {
                RunStatus::Completed
            } else {
                RunStatus::Incomplete
            };
        }
        if options.max_batches.is_some_and(|max| batches_run >= max) {
            break RunStatus::BatchLimit;
        }

        let slice: Vec<CommentContext> = pending
            .iter()
            .take(batch_size)
            .map(|ctx| (*ctx).clone())
            .collect();
        attempted.extend(slice.iter().map(|ctx| ctx.comment_id()));
        batches_run += 1;

        info!(
            pr_number,
            batch = batches_run,
            size = slice.len(),
            processed = state.processed_count(),
            total,
            "processing batch"
        );

        let result = tokio::time::timeout_at(deadline, dispatcher.dispatch(&slice)).await;
        let outcome = match result {
            Err(_) => {
                save(store, &state)?;
                warn!(
                    pr_number,
                    processed = state.processed_count(),
                    total,
                    "deadline reached; checkpoint saved"
                );
                return Err(PipelineError::DeadlineExceeded {
                    processed: state.processed_count(),
                    total,
                }
                .into());
            }
            Ok(Err(err)) => {
                save(store, &state)?;
                return Err(err.into());
            }
            Ok(Ok(outcome)) => outcome,
        };

        let completed: HashSet<i64> = outcome.completed_ids().collect();
        let completed_ctx: Vec<&CommentContext> = slice
            .iter()
            .filter(|ctx| completed.contains(&ctx.comment_id()))
            .collect();
        failed.extend(outcome.failed.iter().map(|(id, _)| *id));
        state.record_batch(&completed_ctx, outcome.candidates);
        save(store, &state)?;
    };

    if status == RunStatus::Completed {
        store.delete_checkpoint(pr_number)?;
        info!(pr_number, total, "all comments processed; checkpoint removed");
    } else {
        info!(
            pr_number,
            processed = state.processed_count(),
            remaining = total.saturating_sub(state.processed_count()),
            "stopping with checkpoint kept; re-run to continue"
        );
    }

    let processed_ids: HashSet<i64> = state.processed.keys().copied().collect();
    Ok(IncrementalOutcome {
        status,
        processed: state.processed_count(),
        candidates: state.partial_tasks,
        processed_ids,
        total,
        batches_run,
        failed,
        resumed,
    })
}

fn init_state(
    pr_number: u64,
    contexts: &[CommentContext],
    store: &dyn CheckpointStore,
    options: &IncrementalOptions,
) -> anyhow::Result<(CheckpointState, bool)> {
    if options.resume {
        match store.load_checkpoint(pr_number)? {
            Some(state) if state.is_stale(options.max_checkpoint_age) => {
                info!(pr_number, started_at = %state.started_at, "ignoring stale checkpoint");
            }
            Some(mut state) => {
                let live: HashSet<i64> = contexts.iter().map(|c| c.comment_id()).collect();
                state.retain_comments(&live);
                state.total_comments = contexts.len();
                info!(
                    pr_number,
                    processed = state.processed_count(),
                    total = contexts.len(),
                    "resuming from checkpoint"
                );
                return Ok((state, true));
            }
            None => {}
        }
    }
    Ok((CheckpointState::new(pr_number, contexts.len()), false))
}

fn save(store: &dyn CheckpointStore, state: &CheckpointState) -> Result<(), PipelineError> {
    store
        .save_checkpoint(state)
        .map_err(|err| PipelineError::Checkpoint(format!("{:#}", err)))
}
