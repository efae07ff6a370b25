//! Stable task identity
//!
//! A task id is a UUIDv5 over (comment id, task index, normalized comment
//! content). Identical input always yields the same id; any content change
//! yields a new one.

use crate::util::collapse_whitespace;
use uuid::Uuid;

/// Namespace for reviewtask task ids.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_5b08_a1e4_27c9_0d3f_8b61);

/// Line-ending and whitespace-only differences do not change identity.
pub fn normalize_content(content: &str) -> String {
    collapse_whitespace(content)
}

pub fn task_id(comment_id: i64, task_index: usize, content: &str) -> String {
    let name = format!(
        "comment:{}:task:{}:content:{}",
        comment_id,
        task_index,
        normalize_content(content)
    );
    Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()).to_string()
}
