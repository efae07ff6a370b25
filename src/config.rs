//! Configuration management for reviewtask
//!
//! Project settings live in `.pr-review/config.json`; a user-level file in
//! `~/.config/reviewtask/config.json` is used when the project has none.

use crate::review::{Priority, TaskStatus};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

const KEYRING_SERVICE: &str = "reviewtask";
const KEYRING_USERNAME: &str = "openrouter_api_key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub priority_rules: PriorityRules,
    #[serde(default)]
    pub task_settings: TaskSettings,
    #[serde(default)]
    pub ai_settings: AiSettings,
}

/// Human-readable guidance per priority, included in the oracle prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRules {
    pub critical: String,
    pub high: String,
    pub medium: String,
    pub low: String,
}

impl Default for PriorityRules {
    fn default() -> Self {
        Self {
            critical: "Security vulnerabilities, data loss, crashes, authentication bypass".into(),
            high: "Incorrect behavior, performance regressions, missing error handling".into(),
            medium: "Maintainability, missing tests, unclear logic".into(),
            low: "Style, naming, formatting, optional suggestions".into(),
        }
    }
}

impl PriorityRules {
    pub fn rule_for(&self, priority: Priority) -> &str {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }
}

/// How the oracle's suggested status and the low-priority pattern status combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPrecedence {
    /// Oracle-assigned status wins when present.
    #[default]
    OracleFirst,
    /// Low-priority pattern matches always get `low_priority_status`.
    PatternFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub default_status: TaskStatus,
    pub low_priority_patterns: Vec<String>,
    pub low_priority_status: TaskStatus,
    pub process_nitpick_comments: bool,
    pub nitpick_priority: Priority,
    pub status_precedence: StatusPrecedence,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            default_status: TaskStatus::Todo,
            low_priority_patterns: [
                "nit:",
                "nits:",
                "minor:",
                "suggestion:",
                "consider:",
                "optional:",
                "style:",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            low_priority_status: TaskStatus::Pending,
            process_nitpick_comments: true,
            nitpick_priority: Priority::Low,
            status_precedence: StatusPrecedence::OracleFirst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// Local CLI process (default `claude`).
    #[default]
    Command,
    /// OpenRouter chat completions API.
    Openrouter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub oracle: OracleKind,
    pub command: String,
    pub model: Option<String>,
    /// Total attempts per invocation when smart retry is enabled.
    pub max_retries: u32,
    pub smart_retry: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub batch_size: usize,
    pub max_batches: Option<usize>,
    /// Deadline for a whole incremental run.
    pub timeout_secs: u64,
    /// Deadline for a single oracle call.
    pub call_timeout_secs: u64,
    pub fast_mode: bool,
    pub min_comment_chars: usize,
    pub deduplication_enabled: bool,
    pub similarity_threshold: f64,
    pub semantic_dedup: bool,
    pub checkpoint_max_age_hours: i64,
    pub analytics_retention_days: i64,
    /// Requests above this many characters are shrunk before the first attempt.
    pub prompt_size_threshold: usize,
    pub user_language: Option<String>,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            oracle: OracleKind::Command,
            command: "claude".to_string(),
            model: None,
            max_retries: 5,
            smart_retry: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            batch_size: 5,
            max_batches: None,
            timeout_secs: 600,
            call_timeout_secs: 120,
            fast_mode: false,
            min_comment_chars: 20,
            deduplication_enabled: true,
            similarity_threshold: 0.8,
            semantic_dedup: true,
            checkpoint_max_age_hours: 24,
            analytics_retention_days: 30,
            prompt_size_threshold: 32_000,
            user_language: None,
        }
    }
}

impl Config {
    /// User-level config directory
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("reviewtask").join(CONFIG_FILE))
    }

    /// Load config from the project data dir, then the user config dir, or defaults.
    pub fn load(data_dir: &Path) -> Self {
        let project_path = data_dir.join(CONFIG_FILE);
        let mut config = Self::load_from(&project_path)
            .or_else(|| Self::user_config_path().and_then(|p| Self::load_from(&p)))
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_from(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(cmd) = std::env::var("REVIEWTASK_ORACLE_CMD") {
            if !cmd.trim().is_empty() {
                self.ai_settings.command = cmd.trim().to_string();
            }
        }
    }

    /// Save config into the project data dir
    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        crate::storage::write_atomic(&path, &content)
    }

    /// OpenRouter API key (environment first, then system keychain)
    pub fn openrouter_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        if cfg!(test) {
            return None;
        }
        match Entry::new(KEYRING_SERVICE, KEYRING_USERNAME).and_then(|e| e.get_password()) {
            Ok(key) => Some(key),
            Err(keyring::Error::NoEntry) => None,
            Err(err) => {
                warn!(error = %err, "failed to read API key from system keychain; set OPENROUTER_API_KEY instead");
                None
            }
        }
    }

    pub fn checkpoint_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ai_settings.checkpoint_max_age_hours.max(0))
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
