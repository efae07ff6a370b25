//! Best-effort repair of oracle output that failed to parse as JSON.
//!
//! Strategies run in a fixed order and are cumulative: each one works on the
//! output of the previous, and parseability is re-tested after every step.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    StripFence,
    EscapeControlChars,
    BalanceBrackets,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::StripFence => "strip-fence",
            RepairStrategy::EscapeControlChars => "escape-control-chars",
            RepairStrategy::BalanceBrackets => "balance-brackets",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repaired {
    pub text: String,
    /// Strategies applied, in order. Empty when the input already parsed.
    pub applied: Vec<RepairStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairError {
    /// Parse error of the unmodified input.
    pub original: String,
    pub attempted: Vec<RepairStrategy>,
    /// The input ended inside a string or with unclosed brackets.
    pub looks_truncated: bool,
}

impl fmt::Display for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attempted: Vec<&str> = self.attempted.iter().map(|s| s.as_str()).collect();
        write!(
            f,
            "{} (repair attempted: {})",
            self.original,
            if attempted.is_empty() {
                "none".to_string()
            } else {
                attempted.join(", ")
            }
        )
    }
}

impl std::error::Error for RepairError {}

fn parses(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

/// Repair `raw` into parseable JSON, or explain why that was not possible.
pub fn repair(raw: &str) -> Result<Repaired, RepairError> {
    let original = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(_) => {
            return Ok(Repaired {
                text: raw.to_string(),
                applied: Vec::new(),
            })
        }
        Err(err) => err.to_string(),
    };

    let mut current = raw.to_string();
    let mut applied = Vec::new();
    let mut attempted = Vec::new();

    let steps: [(RepairStrategy, fn(&str) -> Option<String>); 3] = [
        (RepairStrategy::StripFence, strip_fence),
        (RepairStrategy::EscapeControlChars, escape_control_chars),
        (RepairStrategy::BalanceBrackets, balance_brackets),
    ];

    for (strategy, step) in steps {
        attempted.push(strategy);
        let Some(next) = step(&current) else {
            continue;
        };
        current = next;
        applied.push(strategy);
        if parses(&current) {
            return Ok(Repaired {
                text: current,
                applied,
            });
        }
    }

    Err(RepairError {
        original,
        attempted,
        looks_truncated: scan(raw).is_open(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  STRATEGIES
// ═══════════════════════════════════════════════════════════════════════════

/// Remove a ```lang ... ``` block that encloses the whole response. A
/// missing closing fence is tolerated since truncated output often loses it.
/// Backticks elsewhere belong to the payload and are left alone.
fn strip_fence(text: &str) -> Option<String> {
    let after_open = text.trim().strip_prefix("```")?;
    // Skip the optional language tag on the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = after_open[body_start..].trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    Some(body.trim().to_string())
}

/// Escape raw control characters that appear inside string literals.
fn escape_control_chars(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => {
                out.push_str("\\n");
                changed = true;
            }
            '\r' => {
                out.push_str("\\r");
                changed = true;
            }
            '\t' => {
                out.push_str("\\t");
                changed = true;
            }
            '\u{08}' => {
                out.push_str("\\b");
                changed = true;
            }
            '\u{0c}' => {
                out.push_str("\\f");
                changed = true;
            }
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
                changed = true;
            }
            c => out.push(c),
        }
    }

    changed.then_some(out)
}

/// Close a structure that was cut off. If closing at the end does not yield
/// valid JSON, back off to the last complete element and close there.
fn balance_brackets(text: &str) -> Option<String> {
    let state = scan(text);
    if !state.is_open() {
        return None;
    }

    let closed = close_structure(text);
    if parses(&closed) {
        return Some(closed);
    }

    for cut in state.commas.iter().rev().take(32) {
        let candidate = close_structure(&text[..*cut]);
        if parses(&candidate) {
            return Some(candidate);
        }
    }
    Some(closed)
}

#[derive(Debug, Default)]
struct ScanState {
    stack: Vec<char>,
    in_string: bool,
    escaped: bool,
    /// Byte offsets of commas outside strings, for backing off.
    commas: Vec<usize>,
}

impl ScanState {
    fn is_open(&self) -> bool {
        self.in_string || !self.stack.is_empty()
    }
}

fn scan(text: &str) -> ScanState {
    let mut state = ScanState::default();
    for (i, c) in text.char_indices() {
        if state.in_string {
            if state.escaped {
                state.escaped = false;
            } else if c == '\\' {
                state.escaped = true;
            } else if c == '"' {
                state.in_string = false;
            }
            continue;
        }
        match c {
            '"' => state.in_string = true,
            '[' => state.stack.push(']'),
            '{' => state.stack.push('}'),
            ']' | '}' => {
                if state.stack.last() == Some(&c) {
                    state.stack.pop();
                }
            }
            ',' => state.commas.push(i),
            _ => {}
        }
    }
    state
}

fn close_structure(text: &str) -> String {
    let state = scan(text);
    let mut out = text.to_string();

    if state.in_string {
        if state.escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("null");
    }

    // Innermost opener closes first.
    for closer in state.stack.iter().rev() {
        out.push(*closer);
    }
    out
}
