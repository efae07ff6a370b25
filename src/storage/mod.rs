//! Persistence under `.pr-review/`
//!
//! Layout:
//! - `PR-<n>/reviews.json` cached source reviews
//! - `PR-<n>/tasks.json` durable task set, merged by task id
//! - `PR-<n>/checkpoint.json` incremental progress snapshot
//! - `response_analytics.json` retention-windowed oracle call log
//!
//! `tasks.json` is edited by other tools too, so writes take an exclusive lock.
//! Checkpoint and analytics files have a single writer and take none.

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::monitor::ResponseEvent;
use crate::review::{PersistedTask, Review, TaskStatus};
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};

pub const DATA_DIR: &str = ".pr-review";
const TASKS_FILE: &str = "tasks.json";
const REVIEWS_FILE: &str = "reviews.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const ANALYTICS_FILE: &str = "response_analytics.json";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<PersistedTask>,
}

impl Default for TaskFile {
    fn default() -> Self {
        Self {
            generated_at: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
    pub cancelled: usize,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReviewsFile {
    Wrapped { reviews: Vec<Review> },
    Bare(Vec<Review>),
}

/// The storage manager
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

struct StorageLock {
    file: std::fs::File,
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Storage {
    /// Storage rooted at `<project_root>/.pr-review`.
    pub fn new(project_root: &Path) -> Self {
        Self {
            data_dir: project_root.join(DATA_DIR),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn pr_dir(&self, pr_number: u64) -> PathBuf {
        self.data_dir.join(format!("PR-{}", pr_number))
    }

    pub fn tasks_path(&self, pr_number: u64) -> PathBuf {
        self.pr_dir(pr_number).join(TASKS_FILE)
    }

    pub fn reviews_path(&self, pr_number: u64) -> PathBuf {
        self.pr_dir(pr_number).join(REVIEWS_FILE)
    }

    fn checkpoint_path(&self, pr_number: u64) -> PathBuf {
        self.pr_dir(pr_number).join(CHECKPOINT_FILE)
    }

    fn analytics_path(&self) -> PathBuf {
        self.data_dir.join(ANALYTICS_FILE)
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("creating {}", self.data_dir.display()))?;
        }
        self.ensure_ignored()?;
        Ok(())
    }

    fn ensure_pr_dir(&self, pr_number: u64) -> anyhow::Result<PathBuf> {
        self.ensure_dir()?;
        let dir = self.pr_dir(pr_number);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    /// Keep `.pr-review/` out of version control: `.gitignore` when present,
    /// otherwise `.git/info/exclude`, otherwise a new `.gitignore`.
    fn ensure_ignored(&self) -> anyhow::Result<()> {
        let Some(repo_root) = self.data_dir.parent() else {
            return Ok(());
        };
        let entry = format!("{}/", DATA_DIR);

        let gitignore_path = repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, &entry);
        }

        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let info_exclude_path = git_dir.join("info").join("exclude");
            if let Some(parent) = info_exclude_path.parent() {
                if fs::create_dir_all(parent).is_ok()
                    && append_ignore_entry(&info_exclude_path, &entry).is_ok()
                {
                    return Ok(());
                }
            }
        }

        append_ignore_entry(&gitignore_path, &entry)
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StorageLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.data_dir.exists() {
            return Err(anyhow::anyhow!("Data directory missing"));
        }

        let lock_path = self.data_dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= StdDuration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for task file lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(StdDuration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(StorageLock { file })
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  REVIEWS
    // ═══════════════════════════════════════════════════════════════════════

    /// Load reviews from an explicit file, or the cached `reviews.json`.
    ///
    /// Accepts either a bare array or `{ "reviews": [...] }`.
    pub fn load_reviews(&self, pr_number: u64, file: Option<&Path>) -> anyhow::Result<Vec<Review>> {
        let path = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.reviews_path(pr_number));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading reviews from {}", path.display()))?;
        let parsed: ReviewsFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing reviews in {}", path.display()))?;
        Ok(match parsed {
            ReviewsFile::Wrapped { reviews } => reviews,
            ReviewsFile::Bare(reviews) => reviews,
        })
    }

    pub fn save_reviews(&self, pr_number: u64, reviews: &[Review]) -> anyhow::Result<()> {
        let dir = self.ensure_pr_dir(pr_number)?;
        let content = serde_json::to_string_pretty(reviews)?;
        write_atomic(&dir.join(REVIEWS_FILE), &content)
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  TASKS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn load_tasks(&self, pr_number: u64) -> anyhow::Result<TaskFile> {
        let path = self.tasks_path(pr_number);
        if !path.exists() {
            return Ok(TaskFile::default());
        }
        let _lock = self.lock(false)?;
        read_task_file(&path)
    }

    /// `merge_tasks` on the blocking pool, for async callers. Waiting on the
    /// task file lock can take seconds and must not stall a runtime thread.
    pub async fn merge_tasks_async(
        &self,
        pr_number: u64,
        incoming: Vec<PersistedTask>,
        reprocessed: HashSet<i64>,
    ) -> anyhow::Result<MergeSummary> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.merge_tasks(pr_number, incoming, &reprocessed))
            .await
            .context("task merge worker failed")?
    }

    /// Merge `incoming` into the PR's task file by id, last write wins.
    ///
    /// An existing task keeps its status and creation time. Tasks from a
    /// comment in `reprocessed` whose id is absent from `incoming` are
    /// superseded: cancelled if no work had started on them.
    pub fn merge_tasks(
        &self,
        pr_number: u64,
        incoming: Vec<PersistedTask>,
        reprocessed: &HashSet<i64>,
    ) -> anyhow::Result<MergeSummary> {
        let dir = self.ensure_pr_dir(pr_number)?;
        let _lock = self.lock(true)?;
        let path = dir.join(TASKS_FILE);

        let mut file = if path.exists() {
            read_task_file(&path)?
        } else {
            TaskFile::default()
        };

        let now = Utc::now();
        let incoming_ids: HashSet<String> = incoming.iter().map(|t| t.id.clone()).collect();
        let mut summary = MergeSummary::default();

        for task in file.tasks.iter_mut() {
            if reprocessed.contains(&task.source_comment_id)
                && !incoming_ids.contains(&task.id)
                && task.status.is_untouched()
            {
                debug!(task_id = %task.id, comment_id = task.source_comment_id, "cancelling superseded task");
                task.status = TaskStatus::Cancelled;
                task.updated_at = now;
                summary.cancelled += 1;
            }
        }

        let mut index: HashMap<String, usize> = file
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        for mut task in incoming {
            match index.get(&task.id) {
                Some(&i) => {
                    let existing = &file.tasks[i];
                    task.status = existing.status;
                    task.created_at = existing.created_at;
                    task.updated_at = now;
                    file.tasks[i] = task;
                    summary.updated += 1;
                }
                None => {
                    index.insert(task.id.clone(), file.tasks.len());
                    file.tasks.push(task);
                    summary.added += 1;
                }
            }
        }

        file.generated_at = now;
        summary.total = file.tasks.len();
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(&path, &content)?;
        Ok(summary)
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  ANALYTICS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn load_analytics(&self) -> Vec<ResponseEvent> {
        let path = self.analytics_path();
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        match serde_json::from_str(&content) {
            Ok(events) => events,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable analytics log");
                Vec::new()
            }
        }
    }

    pub fn save_analytics(&self, events: &[ResponseEvent]) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let content = serde_json::to_string(events)?;
        write_atomic(&self.analytics_path(), &content)
    }

    pub fn has_checkpoint(&self, pr_number: u64) -> bool {
        self.checkpoint_path(pr_number).exists()
    }
}

impl CheckpointStore for Storage {
    fn save_checkpoint(&self, state: &CheckpointState) -> anyhow::Result<()> {
        let dir = self.ensure_pr_dir(state.pr_number)?;
        let content = serde_json::to_string_pretty(state)?;
        write_atomic(&dir.join(CHECKPOINT_FILE), &content)
            .with_context(|| format!("saving checkpoint for PR {}", state.pr_number))
    }

    fn load_checkpoint(&self, pr_number: u64) -> anyhow::Result<Option<CheckpointState>> {
        let path = self.checkpoint_path(pr_number);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable checkpoint");
                Ok(None)
            }
        }
    }

    fn delete_checkpoint(&self, pr_number: u64) -> anyhow::Result<()> {
        match fs::remove_file(self.checkpoint_path(pr_number)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_task_file(path: &Path) -> anyhow::Result<TaskFile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn append_ignore_entry(path: &Path, entry: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == DATA_DIR
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    use std::io::Write;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# reviewtask data")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

/// Write via a temp file and rename.
///
/// # Platform Notes
/// - **Unix**: `rename()` is atomic.
/// - **Windows**: `rename()` fails if the destination exists, so the old file
///   is moved to `.bak` first and restored if the final rename fails.
/// - The temp file is restricted to 0600 before any content is written.
pub(crate) fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!(error = %err, path = %tmp_path.display(), "failed to restrict temp file permissions");
        }
    }

    file.write_all(content.as_bytes())?;
    drop(file);

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}
