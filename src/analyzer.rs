//! End-to-end analysis of one pull request
//!
//! extract -> checkpointed incremental dispatch -> identity -> dedupe -> merge.
//! Response analytics are flushed on every exit path.

use crate::config::{Config, StatusPrecedence, TaskSettings};
use crate::dedupe::{deduplicate, DedupeOptions};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::extract::{extract_comment_contexts, patterns, ExtractOptions};
use crate::identity::task_id;
use crate::incremental::{run_incremental, IncrementalOptions, RunStatus};
use crate::monitor::ResponseMonitor;
use crate::oracle::{Oracle, PromptBuilder};
use crate::retry::RetryPolicy;
use crate::review::{CommentContext, PersistedTask, TaskCandidate, TaskStatus};
use crate::storage::{MergeSummary, Storage};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Per-run overrides on top of `Config`.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub reviews_file: Option<PathBuf>,
    pub resume: bool,
    pub batch_size: Option<usize>,
    pub max_batches: Option<usize>,
    pub fast_mode: bool,
    pub timeout: Option<Duration>,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            reviews_file: None,
            resume: true,
            batch_size: None,
            max_batches: None,
            fast_mode: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeReport {
    pub status: RunStatus,
    pub contexts: usize,
    pub resolved_filtered: usize,
    pub nitpick_filtered: usize,
    pub processed: usize,
    pub failed: Vec<i64>,
    pub resumed: bool,
    pub tasks_generated: usize,
    pub merge: MergeSummary,
}

pub struct Analyzer {
    storage: Storage,
    config: Config,
}

impl Analyzer {
    pub fn new(storage: Storage, config: Config) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn analyze(
        &self,
        oracle: &dyn Oracle,
        pr_number: u64,
        options: &AnalyzeOptions,
    ) -> anyhow::Result<AnalyzeReport> {
        let ai = &self.config.ai_settings;
        let monitor = ResponseMonitor::with_events(
            self.storage.load_analytics(),
            chrono::Duration::days(ai.analytics_retention_days.max(1)),
        );

        let result = self.run(oracle, pr_number, options, &monitor).await;
        if let Err(err) = self.storage.save_analytics(&monitor.events()) {
            warn!(error = %err, "failed to save response analytics");
        }
        result
    }

    async fn run(
        &self,
        oracle: &dyn Oracle,
        pr_number: u64,
        options: &AnalyzeOptions,
        monitor: &ResponseMonitor,
    ) -> anyhow::Result<AnalyzeReport> {
        let reviews = self
            .storage
            .load_reviews(pr_number, options.reviews_file.as_deref())?;
        if options.reviews_file.is_some() {
            self.storage.save_reviews(pr_number, &reviews)?;
        }

        let extraction = extract_comment_contexts(
            &reviews,
            ExtractOptions {
                process_nitpicks: self.config.task_settings.process_nitpick_comments,
            },
        );

        let mut ai = self.config.ai_settings.clone();
        ai.fast_mode |= options.fast_mode;
        if let Some(size) = options.batch_size {
            ai.batch_size = size;
        }
        if options.max_batches.is_some() {
            ai.max_batches = options.max_batches;
        }

        let policy = RetryPolicy::from_settings(&ai);
        let prompts = PromptBuilder::new(&self.config);
        let dispatcher = Dispatcher::new(
            oracle,
            prompts.clone(),
            policy.clone(),
            DispatchOptions::from_settings(&ai),
        )
        .with_monitor(monitor);

        let mut incremental =
            IncrementalOptions::from_settings(&ai, self.config.checkpoint_max_age());
        incremental.resume = options.resume;
        if let Some(timeout) = options.timeout {
            incremental.timeout = timeout;
        }

        let outcome = run_incremental(
            pr_number,
            &extraction.contexts,
            &dispatcher,
            &self.storage,
            &incremental,
        )
        .await?;

        let tasks = build_tasks(
            outcome.candidates,
            &extraction.contexts,
            &self.config.task_settings,
            pr_number,
        );
        let generated = tasks.len();
        let tasks = deduplicate(
            tasks,
            oracle,
            &prompts,
            &policy,
            &DedupeOptions::from_settings(&ai),
        )
        .await;

        let merge = self
            .storage
            .merge_tasks_async(pr_number, tasks, outcome.processed_ids.clone())
            .await?;
        info!(
            pr_number,
            added = merge.added,
            updated = merge.updated,
            cancelled = merge.cancelled,
            total = merge.total,
            "task file updated"
        );

        Ok(AnalyzeReport {
            status: outcome.status,
            contexts: extraction.contexts.len(),
            resolved_filtered: extraction.resolved_filtered,
            nitpick_filtered: extraction.nitpick_filtered,
            processed: outcome.processed,
            failed: outcome.failed,
            resumed: outcome.resumed,
            tasks_generated: generated,
            merge,
        })
    }
}

/// Turn candidates into durable tasks with ids, statuses and priorities.
pub fn build_tasks(
    candidates: Vec<TaskCandidate>,
    contexts: &[CommentContext],
    settings: &TaskSettings,
    pr_number: u64,
) -> Vec<PersistedTask> {
    let bodies: HashMap<i64, &str> = contexts
        .iter()
        .map(|ctx| (ctx.comment_id(), ctx.body()))
        .collect();
    let now = Utc::now();

    candidates
        .into_iter()
        .map(|candidate| {
            let body = bodies
                .get(&candidate.source_comment_id)
                .copied()
                .unwrap_or(candidate.origin_text.as_str());
            let low_priority = patterns::matches_low_priority(body, &settings.low_priority_patterns);
            let status = resolve_status(candidate.initial_status, low_priority, settings);
            let priority = if patterns::is_nitpick(body) {
                settings.nitpick_priority
            } else {
                candidate.priority
            };

            PersistedTask {
                id: task_id(candidate.source_comment_id, candidate.task_index, body),
                description: candidate.description,
                origin_text: candidate.origin_text,
                priority,
                source_review_id: candidate.source_review_id,
                source_comment_id: candidate.source_comment_id,
                file: candidate.file,
                line: candidate.line,
                task_index: candidate.task_index,
                status,
                created_at: now,
                updated_at: now,
                pr_number,
            }
        })
        .collect()
}

fn resolve_status(
    suggested: Option<TaskStatus>,
    low_priority: bool,
    settings: &TaskSettings,
) -> TaskStatus {
    let pattern_status = low_priority.then_some(settings.low_priority_status);
    match settings.status_precedence {
        StatusPrecedence::OracleFirst => suggested.or(pattern_status),
        StatusPrecedence::PatternFirst => pattern_status.or(suggested),
    }
    .unwrap_or(settings.default_status)
}
