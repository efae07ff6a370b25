//! Pattern tables for text classification
//!
//! Resolution markers, nitpick delimiters, priority hints and non-actionable
//! phrases are data here so each classifier stays a small, testable function.

use crate::review::Priority;
use regex::Regex;
use std::sync::OnceLock;

/// Phrases that mark a thread as addressed when the source system did not flag it.
pub const RESOLUTION_MARKERS: &[&str] = &[
    "✅ addressed in commit",
    "addressed in commit",
    "✅ resolved",
    "marked as resolved",
    "this has been resolved",
    "this has been fixed",
    "fixed in commit",
    "resolved in commit",
];

/// Structured and plain-text forms of a low-priority ("nitpick") block.
///
/// Every pattern is anchored at start-of-text or start-of-line (`(?m)^`), so a
/// mid-sentence "nit:" does not count.
const NITPICK_PATTERNS: &[(&str, &str)] = &[
    (
        "collapsed-summary",
        r"(?im)^\s*<summary>\s*(?:🧹\s*)?nitpick comments?\s*\(\d+\)\s*</summary>",
    ),
    (
        "markdown-heading",
        r"(?im)^\s*(?:#{1,6}\s*|\*\*)\s*(?:🧹\s*)?nitpick comments?\s*\(\d+\)",
    ),
    ("plain-prefix", r"(?im)^\s*(?:\*\*|_)?(?:nit|nits|nitpick|nitpicks)(?:\*\*|_)?\s*:"),
];

/// Fallback priority hints, applied only when the oracle did not give a priority.
const PRIORITY_HINTS: &[(Priority, &str)] = &[
    (
        Priority::Critical,
        r"(?i)\b(?:security|vulnerab\w*|injection|data loss|crash(?:es)?|panic)\b",
    ),
    (
        Priority::High,
        r"(?i)\b(?:bug|incorrect|race condition|deadlock|leak|broken)\b",
    ),
    (Priority::Low, r"(?i)\b(?:typo|naming|formatting|style|nit)\b"),
];

/// Whole-response phrases meaning "nothing to do for this comment".
pub const NON_ACTIONABLE_PHRASES: &[&str] = &[
    "no actionable",
    "no tasks",
    "nothing actionable",
    "no action required",
    "no action needed",
    "lgtm",
];

struct CompiledPatterns {
    nitpick: Vec<(&'static str, Regex)>,
    priority: Vec<(Priority, Regex)>,
}

fn compiled() -> &'static CompiledPatterns {
    static PATTERNS: OnceLock<CompiledPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CompiledPatterns {
        nitpick: NITPICK_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (*name, re)))
            .collect(),
        priority: PRIORITY_HINTS
            .iter()
            .filter_map(|(priority, pattern)| Regex::new(pattern).ok().map(|re| (*priority, re)))
            .collect(),
    })
}

/// True when `text` contains one of the resolution markers (case-insensitive).
pub fn has_resolution_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    RESOLUTION_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Name of the nitpick pattern that matched, if any.
pub fn nitpick_kind(text: &str) -> Option<&'static str> {
    compiled()
        .nitpick
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
}

pub fn is_nitpick(text: &str) -> bool {
    nitpick_kind(text).is_some()
}

/// True when `text` starts (or has a line starting) with a configured
/// low-priority prefix, case-insensitively.
pub fn matches_low_priority(text: &str, prefixes: &[String]) -> bool {
    let prefixes: Vec<String> = prefixes
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    if prefixes.is_empty() {
        return false;
    }
    text.lines().any(|line| {
        let line = line
            .trim_start()
            .trim_start_matches(['*', '_', '>', '-'])
            .trim_start()
            .to_lowercase();
        prefixes.iter().any(|prefix| line.starts_with(prefix.as_str()))
    })
}

/// Priority suggested by keyword hints, highest first.
pub fn priority_hint(text: &str) -> Option<Priority> {
    compiled()
        .priority
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(priority, _)| *priority)
}

/// True when a plain-text oracle response means "no tasks".
pub fn is_non_actionable(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        return true;
    }
    // Long prose is not a "nothing to do" verdict even if it mentions one.
    if trimmed.chars().count() > 200 {
        return false;
    }
    let lower = trimmed.to_lowercase();
    NON_ACTIONABLE_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        assert_eq!(compiled().nitpick.len(), NITPICK_PATTERNS.len());
        assert_eq!(compiled().priority.len(), PRIORITY_HINTS.len());
    }

    #[test]
    fn resolution_marker_is_case_insensitive() {
        assert!(has_resolution_marker("✅ Addressed in commit abc123"));
        assert!(has_resolution_marker("FIXED IN COMMIT deadbeef"));
        assert!(!has_resolution_marker("Please address this"));
    }

    #[test]
    fn structured_nitpick_block_detected() {
        let body = "<details>\n<summary>🧹 Nitpick comments (3)</summary>\n\n- rename x\n</details>";
        assert_eq!(nitpick_kind(body), Some("collapsed-summary"));

        let lower = "<summary>nitpick comments (1)</summary>";
        assert!(is_nitpick(lower));
    }

    #[test]
    fn plain_prefix_nitpick_detected_at_start_of_text_or_line() {
        assert_eq!(nitpick_kind("nit: rename this"), Some("plain-prefix"));
        assert!(is_nitpick("NIT: spacing"));
        assert!(is_nitpick("Looks fine overall.\nnit: trailing space"));
        assert!(is_nitpick("**Nitpick**: prefer iter()"));
    }

    #[test]
    fn mid_sentence_nit_does_not_count() {
        assert!(!is_nitpick("This is not a nit: it breaks the build"));
        assert!(!is_nitpick("Unit: seconds"));
    }

    #[test]
    fn low_priority_prefixes_match_line_starts_only() {
        let prefixes = vec!["nit:".to_string(), "Minor:".to_string()];
        assert!(matches_low_priority("minor: rename", &prefixes));
        assert!(matches_low_priority("Overall ok\n> nit: spacing", &prefixes));
        assert!(!matches_low_priority("this is a minor: issue", &prefixes));
        assert!(!matches_low_priority("nit: x", &[]));
    }

    #[test]
    fn priority_hints_pick_highest_first() {
        assert_eq!(
            priority_hint("SQL injection here, also a typo"),
            Some(Priority::Critical)
        );
        assert_eq!(priority_hint("there is a race condition"), Some(Priority::High));
        assert_eq!(priority_hint("fix the typo"), Some(Priority::Low));
        assert_eq!(priority_hint("refactor this"), None);
    }

    #[test]
    fn non_actionable_detection() {
        assert!(is_non_actionable(""));
        assert!(is_non_actionable("  [] "));
        assert!(is_non_actionable("No actionable tasks in this comment."));
        assert!(!is_non_actionable("Please refactor the parser"));
    }
}
