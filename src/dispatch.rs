//! Concurrent dispatcher
//!
//! Fans a batch of comment contexts out to one oracle invocation each and
//! gathers the results in a single collector loop. Individual failures are
//! contained; a critical failure ends the batch immediately.

use crate::config::AiSettings;
use crate::error::{OracleError, PipelineError};
use crate::monitor::ResponseMonitor;
use crate::oracle::parse::{candidates_from, decode_tasks};
use crate::oracle::{Oracle, OutputShape, PromptBuilder};
use crate::retry::{Accepted, Retrier, RetryPolicy};
use crate::review::{CommentContext, TaskCandidate};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub fast_mode: bool,
    /// In fast mode, bodies shorter than this are skipped.
    pub min_comment_chars: usize,
    /// Requests larger than this are shrunk before the first attempt.
    pub prompt_size_threshold: usize,
}

impl DispatchOptions {
    pub fn from_settings(ai: &AiSettings) -> Self {
        Self {
            fast_mode: ai.fast_mode,
            min_comment_chars: ai.min_comment_chars,
            prompt_size_threshold: ai.prompt_size_threshold,
        }
    }
}

/// What happened to one context in a batch.
#[derive(Debug)]
enum ContextOutcome {
    Tasks(Vec<TaskCandidate>),
    Skipped,
    Failed(OracleError),
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Candidates in completion order.
    pub candidates: Vec<TaskCandidate>,
    /// Contexts that produced a usable (possibly empty) answer.
    pub succeeded: Vec<i64>,
    pub skipped: Vec<i64>,
    pub failed: Vec<(i64, OracleError)>,
}

impl BatchOutcome {
    /// Contexts whose work is finished: succeeded or deliberately skipped.
    pub fn completed_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.succeeded.iter().chain(self.skipped.iter()).copied()
    }
}

pub struct Dispatcher<'a> {
    oracle: &'a dyn Oracle,
    prompts: PromptBuilder,
    policy: RetryPolicy,
    monitor: Option<&'a ResponseMonitor>,
    options: DispatchOptions,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        prompts: PromptBuilder,
        policy: RetryPolicy,
        options: DispatchOptions,
    ) -> Self {
        let prompts = prompts.fast(options.fast_mode);
        Self {
            oracle,
            prompts,
            policy,
            monitor: None,
            options,
        }
    }

    pub fn with_monitor(mut self, monitor: &'a ResponseMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Process every context concurrently.
    ///
    /// Succeeds when at least one context did not fail. Fails with
    /// `AllContextsFailed` when every context failed, and with `Critical`
    /// as soon as any context hits a critical error.
    pub async fn dispatch(&self, contexts: &[CommentContext]) -> Result<BatchOutcome, PipelineError> {
        let mut in_flight: FuturesUnordered<_> = contexts
            .iter()
            .map(|ctx| async move { (ctx.comment_id(), self.process(ctx).await) })
            .collect();

        let mut outcome = BatchOutcome::default();
        while let Some((comment_id, result)) = in_flight.next().await {
            match result {
                ContextOutcome::Tasks(tasks) => {
                    debug!(comment_id, tasks = tasks.len(), "comment processed");
                    outcome.succeeded.push(comment_id);
                    outcome.candidates.extend(tasks);
                }
                ContextOutcome::Skipped => outcome.skipped.push(comment_id),
                ContextOutcome::Failed(err) if err.is_critical() => {
                    // Dropping the remaining futures cancels sibling calls.
                    return Err(PipelineError::Critical {
                        comment_id,
                        source: err,
                    });
                }
                ContextOutcome::Failed(err) => {
                    warn!(comment_id, error = %err, "dropping comment after retries were exhausted");
                    outcome.failed.push((comment_id, err));
                }
            }
        }

        if !contexts.is_empty() && outcome.failed.len() == contexts.len() {
            let count = outcome.failed.len();
            let last = outcome
                .failed
                .pop()
                .map(|(_, err)| err)
                .unwrap_or_else(|| OracleError::Process("no result".into()));
            return Err(PipelineError::AllContextsFailed { count, last });
        }

        info!(
            succeeded = outcome.succeeded.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            candidates = outcome.candidates.len(),
            "batch dispatched"
        );
        Ok(outcome)
    }

    fn size_budget(&self) -> usize {
        let threshold = self.options.prompt_size_threshold.max(1);
        self.monitor
            .and_then(|m| m.recommended_request_budget())
            .map(|budget| budget.min(threshold))
            .unwrap_or(threshold)
    }

    async fn process(&self, ctx: &CommentContext) -> ContextOutcome {
        if self.options.fast_mode
            && ctx.body().trim().chars().count() < self.options.min_comment_chars
        {
            debug!(comment_id = ctx.comment_id(), "fast mode: skipping short comment");
            return ContextOutcome::Skipped;
        }

        let mut prompt = self.prompts.for_comment(ctx);
        // A learned budget may sit below the header; never shrink past the comment itself.
        let budget = self.size_budget().max(prompt.shrink_floor());
        if prompt.char_len() > budget {
            debug!(
                comment_id = ctx.comment_id(),
                request_chars = prompt.char_len(),
                budget,
                "shrinking request to fit size budget"
            );
            prompt = prompt.shrink_to(budget);
        }

        let label = format!("comment {}", ctx.comment_id());
        let retrier = Retrier::new(self.oracle, &self.policy, self.monitor);
        let result = retrier
            .run(prompt, OutputShape::Structured, &label, |text| {
                decode_tasks(text).map(|decoded| Accepted {
                    repaired: decoded.was_repaired(),
                    value: decoded,
                })
            })
            .await;

        match result {
            Ok(retried) => ContextOutcome::Tasks(candidates_from(retried.value, ctx)),
            Err(err) => ContextOutcome::Failed(err),
        }
    }
}
