use crate::config::{Config, PriorityRules};
use crate::review::{CommentContext, Priority};
use crate::util::truncate_str;

pub const TASK_EXTRACTION_SYSTEM: &str = r#"You turn one code-review comment into concrete, actionable tasks for the pull request author.

RULES:
- One task per distinct change the reviewer asks for. Split compound requests.
- Describe the change, not the reviewer. Start with a verb ("Add", "Rename", "Handle").
- Keep "origin_text" as the exact part of the comment the task came from.
- If the comment asks for nothing (praise, questions already answered, FYI notes), return [].
- Do not invent work that the comment does not ask for.

OUTPUT FORMAT (JSON only, no prose, no code fences):
[
  {
    "description": "Imperative one-sentence task",
    "origin_text": "quoted part of the comment",
    "priority": "critical|high|medium|low",
    "initial_status": "todo|pending"
  }
]"#;

pub const TASK_EXTRACTION_FAST: &str = r#"Extract actionable tasks from this review comment.
Reply with a JSON array only: [{"description": "...", "priority": "critical|high|medium|low"}]. Reply [] if none."#;

pub const DEDUPE_SYSTEM: &str = r#"You receive a list of tasks generated from different review comments on one pull request.
Identify tasks that ask for the same change as an earlier task in the list.

Reply with JSON only: {"remove": ["<id of duplicate>", ...]}
Keep the first occurrence of each duplicate group. Reply {"remove": []} if there are none."#;

/// Marker appended when variable prompt data is cut for a retry.
pub const TRUNCATED_MARKER: &str = "[content truncated for retry]";
/// Replaces variable prompt data when the fixed header alone exceeds the budget.
pub const OMITTED_MARKER: &str = "[omitted for retry]";
/// Data characters a shrunk request keeps at minimum when a floor is applied.
pub const MIN_DATA_CHARS: usize = 400;

/// An oracle request split into a fixed header and variable data.
///
/// Only `data` is ever shrunk; the header is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub header: String,
    pub data: String,
}

impl Prompt {
    pub fn new(header: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            data: data.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.header, self.data)
    }

    /// Rendered size in characters.
    pub fn char_len(&self) -> usize {
        self.header.chars().count() + 2 + self.data.chars().count()
    }

    /// Shrink the rendered prompt to roughly `target_chars`.
    pub fn shrink_to(&self, target_chars: usize) -> Prompt {
        if self.char_len() <= target_chars {
            return self.clone();
        }

        let header_len = self.header.chars().count() + 2;
        let marker_len = TRUNCATED_MARKER.chars().count() + 1;
        if header_len + marker_len >= target_chars {
            return Prompt {
                header: self.header.clone(),
                data: OMITTED_MARKER.to_string(),
            };
        }

        let keep = target_chars - header_len - marker_len;
        let kept = truncate_str(&self.data, keep).trim_end();
        Prompt {
            header: self.header.clone(),
            data: format!("{}\n{}", kept, TRUNCATED_MARKER),
        }
    }

    pub fn was_shrunk(&self) -> bool {
        self.data.ends_with(TRUNCATED_MARKER) || self.is_omitted()
    }

    /// True when the variable data was dropped entirely.
    pub fn is_omitted(&self) -> bool {
        self.data == OMITTED_MARKER
    }

    /// Smallest size this prompt may be shrunk to while still carrying the
    /// header verbatim and at least `MIN_DATA_CHARS` of its data.
    pub fn shrink_floor(&self) -> usize {
        let header_len = self.header.chars().count() + 2;
        let marker_len = TRUNCATED_MARKER.chars().count() + 1;
        let data_len = self.data.chars().count();
        header_len + marker_len + data_len.min(MIN_DATA_CHARS)
    }
}

/// Builds oracle requests from configuration and comment contexts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    rules: PriorityRules,
    language: Option<String>,
    fast: bool,
}

impl PromptBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            rules: config.priority_rules.clone(),
            language: config.ai_settings.user_language.clone(),
            fast: config.ai_settings.fast_mode,
        }
    }

    pub fn fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    fn header(&self) -> String {
        if self.fast {
            return TASK_EXTRACTION_FAST.to_string();
        }
        let mut header = String::from(TASK_EXTRACTION_SYSTEM);
        header.push_str("\n\nPRIORITY GUIDE:");
        for priority in Priority::all() {
            header.push_str(&format!(
                "\n- {}: {}",
                priority.as_str(),
                self.rules.rule_for(priority)
            ));
        }
        if let Some(lang) = self.language.as_deref().filter(|l| !l.trim().is_empty()) {
            header.push_str(&format!("\n\nWrite task descriptions in {}.", lang.trim()));
        }
        header
    }

    /// The request for one comment. The data section starts with the
    /// `comment_id:` line so the comment stays identifiable in logs.
    pub fn for_comment(&self, ctx: &CommentContext) -> Prompt {
        let mut data = format!("comment_id: {}\n", ctx.comment_id());
        if !self.fast {
            data.push_str(&format!("location: {}\n", ctx.location()));
            if !ctx.comment.author.is_empty() {
                data.push_str(&format!("reviewer: {}\n", ctx.comment.author));
            }
            if !ctx.review.state.is_empty() {
                data.push_str(&format!("review_state: {}\n", ctx.review.state));
            }
        }
        data.push_str("\nCOMMENT:\n");
        data.push_str(ctx.body().trim());

        if !self.fast && !ctx.comment.replies.is_empty() {
            data.push_str("\n\nREPLIES:");
            for reply in &ctx.comment.replies {
                data.push_str(&format!("\n- {}: {}", reply.author, reply.body.trim()));
            }
        }
        Prompt::new(self.header(), data)
    }

    /// The cross-comment duplicate check over compact task summaries.
    pub fn for_dedupe(&self, summaries_json: &str) -> Prompt {
        Prompt::new(DEDUPE_SYSTEM, format!("TASKS:\n{}", summaries_json))
    }
}
