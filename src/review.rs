//! Review data model
//!
//! Source records (`Review`, `Comment`, `Reply`) are read as supplied by the
//! source-control client. Everything downstream works on `CommentContext`,
//! `TaskCandidate` and the durable `PersistedTask`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════
//  SOURCE RECORDS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    #[serde(default, alias = "reviewer")]
    pub author: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Thread resolution flag reported by the source system.
    #[serde(default, alias = "resolved")]
    pub is_resolved: bool,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  UNITS OF WORK
// ═══════════════════════════════════════════════════════════════════════════

/// Owning review metadata carried alongside each comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRef {
    pub id: i64,
    pub author: String,
    pub state: String,
}

/// One unit of review feedback: an inline comment or a review body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentContext {
    pub review: ReviewRef,
    pub comment: Comment,
    /// True when this context was synthesized from a review body.
    pub from_review_body: bool,
}

impl CommentContext {
    pub fn comment_id(&self) -> i64 {
        self.comment.id
    }

    pub fn body(&self) -> &str {
        &self.comment.body
    }

    pub fn location(&self) -> String {
        if self.comment.file.is_empty() {
            "(review body)".to_string()
        } else {
            format!("{}:{}", self.comment.file, self.comment.line)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn all() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ]
    }

    /// Lenient parse used on oracle output; unknown values fall back to medium.
    pub fn parse_lenient(raw: Option<&str>) -> Priority {
        raw.and_then(|s| s.parse().ok()).unwrap_or(Priority::Medium)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" | "normal" => Ok(Priority::Medium),
            "low" | "nit" | "nitpick" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Pending,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Pending => "pending",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no work has started on the task yet.
    pub fn is_untouched(&self) -> bool {
        matches!(self, TaskStatus::Todo | TaskStatus::Pending)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "doing" | "in_progress" | "in-progress" => Ok(TaskStatus::Doing),
            "done" => Ok(TaskStatus::Done),
            "pending" => Ok(TaskStatus::Pending),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed task emitted by the oracle for a single comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCandidate {
    pub description: String,
    pub origin_text: String,
    pub priority: Priority,
    #[serde(default)]
    pub initial_status: Option<TaskStatus>,
    pub task_index: usize,
    pub source_comment_id: i64,
    pub source_review_id: i64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
}

/// The durable task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: String,
    pub description: String,
    pub origin_text: String,
    pub priority: Priority,
    pub source_review_id: i64,
    pub source_comment_id: i64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub task_index: usize,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pr_number: u64,
}
