//! Decoding oracle responses into task candidates.
//!
//! The oracle answers in one of several shapes. Each known shape is tried in a
//! fixed order; anything else is a malformed response.

use super::repair::{repair, RepairStrategy};
use crate::error::OracleError;
use crate::extract::patterns;
use crate::review::{CommentContext, Priority, TaskCandidate, TaskStatus};
use crate::util::truncate;
use serde::Deserialize;
use serde_json::Value;

/// Which known shape a response matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `[ {task}, ... ]`
    TaskArray,
    /// `{ "tasks": [ {task}, ... ] }`
    TasksObject,
    /// A single `{task}` object.
    SingleTask,
    /// Prose (or an empty array) meaning "nothing to do".
    NonActionable,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawTask {
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "origin")]
    pub origin_text: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, alias = "status")]
    pub initial_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub tasks: Vec<RawTask>,
    pub shape: ResponseShape,
    /// Repair strategies needed to make the response parse.
    pub repairs: Vec<RepairStrategy>,
    /// A `{"result": ...}` envelope was unwrapped.
    pub unwrapped_envelope: bool,
}

impl Decoded {
    pub fn was_repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Decode a raw response into task records.
pub fn decode_tasks(raw: &str) -> Result<Decoded, OracleError> {
    decode_inner(raw, true)
}

fn decode_inner(raw: &str, allow_envelope: bool) -> Result<Decoded, OracleError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(non_actionable(Vec::new()));
    }

    let (value, repairs) = match repair(trimmed) {
        Ok(repaired) => match serde_json::from_str::<Value>(&repaired.text) {
            Ok(value) => (value, repaired.applied),
            Err(err) => return Err(OracleError::Malformed(err.to_string())),
        },
        Err(err) => {
            if patterns::is_non_actionable(trimmed) {
                return Ok(non_actionable(Vec::new()));
            }
            if err.looks_truncated {
                return Err(OracleError::Truncated(format!(
                    "{}; response tail: {}",
                    err,
                    tail(trimmed, 80)
                )));
            }
            // Prose with an embedded array is still a task list.
            if let Some(decoded) = decode_embedded_array(trimmed) {
                return Ok(decoded);
            }
            return Err(OracleError::Malformed(format!(
                "{}; response preview: {}",
                err,
                truncate(trimmed, 120)
            )));
        }
    };

    let mut decoded = decode_value(value, allow_envelope)?;
    if decoded.repairs.is_empty() {
        decoded.repairs = repairs;
    }
    Ok(decoded)
}

fn decode_value(value: Value, allow_envelope: bool) -> Result<Decoded, OracleError> {
    match value {
        Value::Array(items) => {
            let tasks = tasks_from_items(items)?;
            let shape = if tasks.is_empty() {
                ResponseShape::NonActionable
            } else {
                ResponseShape::TaskArray
            };
            Ok(Decoded {
                tasks,
                shape,
                repairs: Vec::new(),
                unwrapped_envelope: false,
            })
        }
        Value::Object(mut map) => {
            if let Some(tasks) = map.remove("tasks") {
                let Value::Array(items) = tasks else {
                    return Err(OracleError::Malformed(
                        "\"tasks\" field is not an array".into(),
                    ));
                };
                return Ok(Decoded {
                    tasks: tasks_from_items(items)?,
                    shape: ResponseShape::TasksObject,
                    repairs: Vec::new(),
                    unwrapped_envelope: false,
                });
            }
            if allow_envelope {
                if let Some(result) = map.remove("result") {
                    let mut inner = match result {
                        Value::String(text) => decode_inner(&text, false)?,
                        other => decode_value(other, false)?,
                    };
                    inner.unwrapped_envelope = true;
                    return Ok(inner);
                }
            }
            if map.contains_key("description") {
                let task: RawTask = serde_json::from_value(Value::Object(map))
                    .map_err(|e| OracleError::Malformed(format!("invalid task object: {}", e)))?;
                return Ok(Decoded {
                    tasks: vec![task],
                    shape: ResponseShape::SingleTask,
                    repairs: Vec::new(),
                    unwrapped_envelope: false,
                });
            }
            let keys: Vec<String> = map.keys().cloned().collect();
            Err(OracleError::Malformed(format!(
                "unrecognized response object with keys [{}]",
                keys.join(", ")
            )))
        }
        Value::String(text) if patterns::is_non_actionable(&text) => {
            Ok(non_actionable(Vec::new()))
        }
        Value::Null => Ok(non_actionable(Vec::new())),
        other => Err(OracleError::Malformed(format!(
            "unexpected response value: {}",
            truncate(&other.to_string(), 120)
        ))),
    }
}

fn tasks_from_items(items: Vec<Value>) -> Result<Vec<RawTask>, OracleError> {
    items
        .into_iter()
        .map(|item| {
            if !item.is_object() {
                return Err(OracleError::Malformed(
                    "task list contains a non-object entry".into(),
                ));
            }
            serde_json::from_value::<RawTask>(item)
                .map_err(|e| OracleError::Malformed(format!("invalid task object: {}", e)))
        })
        .collect()
}

fn decode_embedded_array(text: &str) -> Option<Decoded> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if start >= end {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let Value::Array(items) = value else {
        return None;
    };
    let tasks = tasks_from_items(items).ok()?;
    let shape = if tasks.is_empty() {
        ResponseShape::NonActionable
    } else {
        ResponseShape::TaskArray
    };
    Some(Decoded {
        tasks,
        shape,
        repairs: Vec::new(),
        unwrapped_envelope: false,
    })
}

fn non_actionable(repairs: Vec<RepairStrategy>) -> Decoded {
    Decoded {
        tasks: Vec::new(),
        shape: ResponseShape::NonActionable,
        repairs,
        unwrapped_envelope: false,
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Validate decoded tasks and attach them to the comment they came from.
///
/// Empty descriptions are dropped. Without an oracle priority the comment text
/// is checked for keyword hints; unknown statuses are treated as absent.
pub fn candidates_from(decoded: Decoded, ctx: &CommentContext) -> Vec<TaskCandidate> {
    decoded
        .tasks
        .into_iter()
        .filter(|task| !task.description.trim().is_empty())
        .enumerate()
        .map(|(index, task)| {
            let priority = match task.priority.as_deref() {
                Some(raw) => Priority::parse_lenient(Some(raw)),
                None => patterns::priority_hint(ctx.body()).unwrap_or(Priority::Medium),
            };
            let initial_status = task
                .initial_status
                .as_deref()
                .and_then(|s| s.parse::<TaskStatus>().ok());
            let origin_text = task
                .origin_text
                .filter(|o| !o.trim().is_empty())
                .unwrap_or_else(|| ctx.body().to_string());
            TaskCandidate {
                description: task.description.trim().to_string(),
                origin_text,
                priority,
                initial_status,
                task_index: index,
                source_comment_id: ctx.comment.id,
                source_review_id: ctx.review.id,
                file: ctx.comment.file.clone(),
                line: ctx.comment.line,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{Comment, ReviewRef};

    fn ctx(body: &str) -> CommentContext {
        CommentContext {
            review: ReviewRef {
                id: 1,
                author: "r".into(),
                state: "COMMENTED".into(),
            },
            comment: Comment {
                id: 42,
                file: "src/main.rs".into(),
                line: 7,
                body: body.into(),
                author: "r".into(),
                created_at: None,
                is_resolved: false,
                replies: Vec::new(),
            },
            from_review_body: false,
        }
    }

    #[test]
    fn decodes_plain_task_array() {
        let decoded =
            decode_tasks(r#"[{"description": "Add tests", "priority": "high"}]"#).unwrap();
        assert_eq!(decoded.shape, ResponseShape::TaskArray);
        assert_eq!(decoded.tasks[0].priority.as_deref(), Some("high"));
        assert!(!decoded.was_repaired());
    }

    #[test]
    fn decodes_tasks_object_and_aliases() {
        let decoded = decode_tasks(
            r#"{"tasks": [{"description": "Fix", "origin": "orig", "status": "pending"}]}"#,
        )
        .unwrap();
        assert_eq!(decoded.shape, ResponseShape::TasksObject);
        assert_eq!(decoded.tasks[0].origin_text.as_deref(), Some("orig"));
        assert_eq!(decoded.tasks[0].initial_status.as_deref(), Some("pending"));
    }

    #[test]
    fn unwraps_result_envelope_holding_a_string() {
        let inner = r#"[{"description": "Rename"}]"#;
        let raw = serde_json::json!({ "result": format!("```json\n{}\n```", inner) }).to_string();
        let decoded = decode_tasks(&raw).unwrap();
        assert!(decoded.unwrapped_envelope);
        assert_eq!(decoded.tasks.len(), 1);
        assert_eq!(decoded.repairs, vec![RepairStrategy::StripFence]);
    }

    #[test]
    fn envelope_is_unwrapped_only_once() {
        let raw = r#"{"result": {"result": []}}"#;
        assert!(matches!(decode_tasks(raw), Err(OracleError::Malformed(_))));
    }

    #[test]
    fn single_task_object() {
        let decoded = decode_tasks(r#"{"description": "One thing"}"#).unwrap();
        assert_eq!(decoded.shape, ResponseShape::SingleTask);
    }

    #[test]
    fn non_actionable_prose_is_zero_tasks() {
        let decoded = decode_tasks("No actionable tasks here.").unwrap();
        assert_eq!(decoded.shape, ResponseShape::NonActionable);
        assert!(decoded.tasks.is_empty());
        assert!(decode_tasks("[]").unwrap().tasks.is_empty());
        assert!(decode_tasks("   ").unwrap().tasks.is_empty());
    }

    #[test]
    fn other_prose_is_malformed() {
        let err = decode_tasks("Sure! I think you should refactor it.").unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[test]
    fn prose_wrapping_an_array_is_decoded() {
        let decoded =
            decode_tasks("Here are the tasks: [{\"description\": \"Do it\"}] hope it helps")
                .unwrap();
        assert_eq!(decoded.tasks.len(), 1);
    }

    #[test]
    fn unknown_object_shape_is_malformed() {
        let err = decode_tasks(r#"{"items": []}"#).unwrap_err();
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn truncated_response_is_recovered_by_repair() {
        let decoded =
            decode_tasks(r#"[{"description": "A"}, {"description": "B", "priority": "lo"#)
                .unwrap();
        assert_eq!(decoded.tasks.len(), 2);
        assert!(decoded.repairs.contains(&RepairStrategy::BalanceBrackets));
    }

    #[test]
    fn candidates_are_validated_and_indexed() {
        let decoded = decode_tasks(
            r#"[{"description": "  "}, {"description": "First", "priority": "urgent"},
                {"description": "Second", "status": "weird"}]"#,
        )
        .unwrap();
        let cands = candidates_from(decoded, &ctx("there is a race condition"));
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].task_index, 0);
        assert_eq!(cands[0].priority, Priority::Medium);
        assert_eq!(cands[1].task_index, 1);
        // No oracle priority: keyword hint from the comment.
        assert_eq!(cands[1].priority, Priority::High);
        assert_eq!(cands[1].initial_status, None);
        assert_eq!(cands[1].origin_text, "there is a race condition");
        assert_eq!(cands[1].source_comment_id, 42);
        assert_eq!(cands[1].line, 7);
    }
}
