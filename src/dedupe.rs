//! Two-tier task deduplication
//!
//! The lexical tier collapses near-identical tasks from the same comment. The
//! semantic tier asks the oracle about duplicates across comments using
//! compact summaries only; if it fails, every task is kept.

use crate::error::OracleError;
use crate::oracle::repair::repair;
use crate::oracle::{Oracle, OutputShape, PromptBuilder};
use crate::retry::{Accepted, Retrier, RetryPolicy};
use crate::review::{PersistedTask, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DedupeOptions {
    pub enabled: bool,
    pub similarity_threshold: f64,
    pub semantic: bool,
}

impl DedupeOptions {
    pub fn from_settings(ai: &crate::config::AiSettings) -> Self {
        Self {
            enabled: ai.deduplication_enabled,
            similarity_threshold: ai.similarity_threshold,
            semantic: ai.semantic_dedup,
        }
    }
}

/// What the semantic tier sends per task. Never includes comment bodies.
#[derive(Debug, Serialize)]
struct TaskSummary<'a> {
    id: &'a str,
    description: &'a str,
    comment_id: i64,
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemovalResponse {
    Object { remove: Vec<String> },
    List(Vec<String>),
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Word-set Jaccard similarity in 0.0..=1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    intersection as f64 / union as f64
}

/// Equal after case and whitespace folding, or similar enough by word set.
/// A short task that is a prefix of a longer one is still a separate task.
fn near_identical(a: &str, b: &str, threshold: f64) -> bool {
    let fold = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    fold(a) == fold(b) || similarity(a, b) >= threshold
}

/// Collapse lexically near-identical tasks that come from the same comment.
///
/// The first task of each group survives and takes the highest priority in
/// the group.
pub fn dedupe_lexical(tasks: Vec<PersistedTask>, threshold: f64) -> Vec<PersistedTask> {
    let mut kept: Vec<PersistedTask> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let duplicate_of = kept.iter().position(|existing| {
            existing.source_comment_id == task.source_comment_id
                && near_identical(&existing.description, &task.description, threshold)
        });
        match duplicate_of {
            Some(index) => {
                debug!(
                    kept = %kept[index].id,
                    dropped = %task.id,
                    "collapsing near-identical task"
                );
                if task.priority > kept[index].priority {
                    kept[index].priority = task.priority;
                }
            }
            None => kept.push(task),
        }
    }
    kept
}

/// Ask the oracle which tasks duplicate earlier ones across comments.
pub async fn dedupe_semantic(
    tasks: Vec<PersistedTask>,
    oracle: &dyn Oracle,
    prompts: &PromptBuilder,
    policy: &RetryPolicy,
) -> Vec<PersistedTask> {
    let comments: HashSet<i64> = tasks.iter().map(|t| t.source_comment_id).collect();
    if tasks.len() < 2 || comments.len() < 2 {
        return tasks;
    }

    let summaries: Vec<TaskSummary<'_>> = tasks
        .iter()
        .map(|t| TaskSummary {
            id: &t.id,
            description: &t.description,
            comment_id: t.source_comment_id,
            priority: t.priority,
        })
        .collect();
    let summaries_json = match serde_json::to_string_pretty(&summaries) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to encode task summaries; skipping semantic dedupe");
            return tasks;
        }
    };

    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let retrier = Retrier::new(oracle, policy, None);
    let result = retrier
        .run(
            prompts.for_dedupe(&summaries_json),
            OutputShape::Structured,
            "semantic dedupe",
            |text| parse_removals(text),
        )
        .await;

    let remove: HashSet<String> = match result {
        Ok(retried) => retried
            .value
            .into_iter()
            .filter(|id| known.contains(id.as_str()))
            .collect(),
        Err(err) => {
            warn!(error = %err, "semantic dedupe failed; keeping all tasks");
            return tasks;
        }
    };

    if remove.len() >= tasks.len() {
        warn!("semantic dedupe asked to remove every task; keeping all tasks");
        return tasks;
    }
    if !remove.is_empty() {
        info!(removed = remove.len(), "semantic dedupe removed duplicate tasks");
    }
    tasks
        .into_iter()
        .filter(|t| !remove.contains(&t.id))
        .collect()
}

fn parse_removals(text: &str) -> Result<Accepted<Vec<String>>, OracleError> {
    let repaired = repair(text.trim()).map_err(|e| {
        if e.looks_truncated {
            OracleError::Truncated(e.to_string())
        } else {
            OracleError::Malformed(e.to_string())
        }
    })?;
    let response: RemovalResponse = serde_json::from_str(&repaired.text)
        .map_err(|e| OracleError::Malformed(format!("unexpected dedupe response: {}", e)))?;
    let ids = match response {
        RemovalResponse::Object { remove } => remove,
        RemovalResponse::List(ids) => ids,
    };
    Ok(Accepted {
        value: ids,
        repaired: !repaired.applied.is_empty(),
    })
}

/// Run both tiers as configured.
pub async fn deduplicate(
    tasks: Vec<PersistedTask>,
    oracle: &dyn Oracle,
    prompts: &PromptBuilder,
    policy: &RetryPolicy,
    options: &DedupeOptions,
) -> Vec<PersistedTask> {
    if !options.enabled {
        return tasks;
    }
    let before = tasks.len();
    let tasks = dedupe_lexical(tasks, options.similarity_threshold);
    let tasks = if options.semantic {
        dedupe_semantic(tasks, oracle, prompts, policy).await
    } else {
        tasks
    };
    if tasks.len() != before {
        info!(before, after = tasks.len(), "deduplicated tasks");
    }
    tasks
}
