//! Error taxonomy
//!
//! `OracleError` classifies a single invocation failure. Critical variants mean
//! the oracle cannot be used at all and abort the run; everything else is
//! recoverable and handled by the retry strategy.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle command '{command}' not found. Install it or set ai_settings.command")]
    NotFound { command: String },

    #[error("oracle authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("oracle call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("request too large: {0}")]
    PayloadTooLarge(String),

    #[error("response truncated: {0}")]
    Truncated(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("oracle process failed: {0}")]
    Process(String),
}

impl OracleError {
    /// Critical failures are not retried and abort the enclosing batch loop.
    pub fn is_critical(&self) -> bool {
        matches!(self, OracleError::NotFound { .. } | OracleError::Auth(_))
    }

    /// Operator-facing remediation hint for critical failures.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            OracleError::NotFound { .. } => Some(
                "Install the oracle CLI (or point ai_settings.command at it), then re-run to resume from the last checkpoint.",
            ),
            OracleError::Auth(_) => Some(
                "Re-authenticate the oracle (or set OPENROUTER_API_KEY), then re-run to resume from the last checkpoint.",
            ),
            _ => None,
        }
    }
}

/// Batch and run-level failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all {count} comments in the batch failed; last error: {last}")]
    AllContextsFailed { count: usize, last: OracleError },

    #[error("critical oracle failure on comment {comment_id}: {source}")]
    Critical {
        comment_id: i64,
        #[source]
        source: OracleError,
    },

    #[error(
        "processing deadline exceeded after {processed}/{total} comments; re-run with --resume to continue"
    )]
    DeadlineExceeded { processed: usize, total: usize },

    #[error("failed to persist checkpoint: {0}")]
    Checkpoint(String),
}

impl PipelineError {
    pub fn is_critical(&self) -> bool {
        matches!(self, PipelineError::Critical { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_classification() {
        assert!(OracleError::NotFound {
            command: "claude".into()
        }
        .is_critical());
        assert!(OracleError::Auth("expired".into()).is_critical());
        assert!(!OracleError::RateLimited("slow down".into()).is_critical());
        assert!(!OracleError::Truncated("eof".into()).is_critical());
    }

    #[test]
    fn test_critical_errors_carry_remediation() {
        let err = OracleError::Auth("expired".into());
        assert!(err.remediation().unwrap().contains("resume"));
        assert!(OracleError::Timeout { secs: 5 }.remediation().is_none());
    }

    #[test]
    fn test_pipeline_error_downcasts_from_anyhow() {
        let err: anyhow::Error = PipelineError::Critical {
            comment_id: 3,
            source: OracleError::Auth("no".into()),
        }
        .into();
        let pipeline = err.downcast_ref::<PipelineError>().unwrap();
        assert!(pipeline.is_critical());
    }
}
