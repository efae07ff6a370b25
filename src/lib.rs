//! reviewtask library crate
//!
//! Turns pull request review comments into a durable task list through an
//! unreliable text-generation oracle. Exposed as a library so the CLI,
//! integration tests and benchmarks share one pipeline.

pub mod analyzer;
pub mod checkpoint;
pub mod config;
pub mod dedupe;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod identity;
pub mod incremental;
pub mod monitor;
pub mod oracle;
pub mod retry;
pub mod review;
pub mod storage;
pub mod util;
