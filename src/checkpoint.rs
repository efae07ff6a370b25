//! Checkpoint state for incremental processing
//!
//! A comment counts as processed only while its stored fingerprint matches the
//! fingerprint of its current content; any edit forces reprocessing.

use crate::review::{Comment, CommentContext, TaskCandidate};
use crate::util::hex_encode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Content fingerprint of a comment: its body plus every reply body.
pub fn fingerprint(comment: &Comment) -> String {
    let mut hasher = Sha256::new();
    hasher.update(comment.body.as_bytes());
    for reply in &comment.replies {
        hasher.update([0u8]);
        hasher.update(reply.body.as_bytes());
    }
    hex_encode(&hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub pr_number: u64,
    pub total_comments: usize,
    /// comment id -> fingerprint at the time it was processed
    #[serde(default)]
    pub processed: BTreeMap<i64, String>,
    #[serde(default)]
    pub partial_tasks: Vec<TaskCandidate>,
    #[serde(default)]
    pub batch_count: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(pr_number: u64, total_comments: usize) -> Self {
        let now = Utc::now();
        Self {
            pr_number,
            total_comments,
            processed: BTreeMap::new(),
            partial_tasks: Vec::new(),
            batch_count: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_processed(&self, ctx: &CommentContext) -> bool {
        self.processed
            .get(&ctx.comment_id())
            .is_some_and(|stored| *stored == fingerprint(&ctx.comment))
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Commit one finished slice.
    ///
    /// `completed` are the contexts whose work is done; any earlier candidates
    /// for those comments are replaced by `candidates`.
    pub fn record_batch(&mut self, completed: &[&CommentContext], candidates: Vec<TaskCandidate>) {
        let ids: HashSet<i64> = completed.iter().map(|ctx| ctx.comment_id()).collect();
        self.partial_tasks
            .retain(|task| !ids.contains(&task.source_comment_id));
        for ctx in completed {
            self.processed
                .insert(ctx.comment_id(), fingerprint(&ctx.comment));
        }
        self.partial_tasks.extend(
            candidates
                .into_iter()
                .filter(|task| ids.contains(&task.source_comment_id)),
        );
        self.batch_count += 1;
        self.updated_at = Utc::now();
    }

    /// Forget comments that no longer exist in the source data.
    pub fn retain_comments(&mut self, live: &HashSet<i64>) {
        self.processed.retain(|id, _| live.contains(id));
        self.partial_tasks
            .retain(|task| live.contains(&task.source_comment_id));
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        is_stale(self, max_age)
    }
}

/// Staleness predicate over the checkpoint's start time.
pub fn is_stale(state: &CheckpointState, max_age: Duration) -> bool {
    Utc::now() - state.started_at > max_age
}

/// Whole-snapshot checkpoint persistence, one record per PR.
pub trait CheckpointStore {
    fn save_checkpoint(&self, state: &CheckpointState) -> anyhow::Result<()>;
    fn load_checkpoint(&self, pr_number: u64) -> anyhow::Result<Option<CheckpointState>>;
    fn delete_checkpoint(&self, pr_number: u64) -> anyhow::Result<()>;
}
