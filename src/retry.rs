//! Retry strategy
//!
//! Each failed oracle call is categorized, scored for truncation likelihood,
//! and mapped to a strategy: retry unchanged, shrink the request, or back off.
//! Critical errors and exhausted attempt budgets end the loop.

use crate::config::AiSettings;
use crate::error::OracleError;
use crate::monitor::{ResponseEvent, ResponseMonitor};
use crate::oracle::{Oracle, OutputShape, Prompt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Requests at or above this size count as "large" when choosing a shrink.
const LARGE_REQUEST_CHARS: usize = 10_000;
/// Truncation score at which a truncated response triggers an aggressive shrink.
const HIGH_TRUNCATION_SCORE: f64 = 0.7;
const AGGRESSIVE_SHRINK: f64 = 0.5;
const MODERATE_SHRINK: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    JsonTruncation,
    PayloadTooLarge,
    RateLimit,
    Timeout,
    Network,
    MalformedResponse,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::JsonTruncation => "json_truncation",
            ErrorCategory::PayloadTooLarge => "payload_too_large",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::MalformedResponse => "malformed_response",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process failures carry free text; these fragments identify the category.
const PROCESS_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("unexpected end of json", ErrorCategory::JsonTruncation),
    ("unterminated string", ErrorCategory::JsonTruncation),
    ("eof while parsing", ErrorCategory::JsonTruncation),
    ("too large", ErrorCategory::PayloadTooLarge),
    ("too long", ErrorCategory::PayloadTooLarge),
    ("rate limit", ErrorCategory::RateLimit),
    ("429", ErrorCategory::RateLimit),
    ("timed out", ErrorCategory::Timeout),
    ("timeout", ErrorCategory::Timeout),
    ("connection", ErrorCategory::Network),
    ("network", ErrorCategory::Network),
    ("invalid json", ErrorCategory::MalformedResponse),
];

pub fn categorize(err: &OracleError) -> ErrorCategory {
    match err {
        OracleError::Truncated(_) => ErrorCategory::JsonTruncation,
        OracleError::PayloadTooLarge(_) => ErrorCategory::PayloadTooLarge,
        OracleError::RateLimited(_) => ErrorCategory::RateLimit,
        OracleError::Timeout { .. } => ErrorCategory::Timeout,
        OracleError::Network(_) => ErrorCategory::Network,
        OracleError::Malformed(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("eof while parsing") || lower.contains("unexpected end") {
                ErrorCategory::JsonTruncation
            } else {
                ErrorCategory::MalformedResponse
            }
        }
        OracleError::Process(msg) => {
            let lower = msg.to_lowercase();
            PROCESS_PATTERNS
                .iter()
                .find(|(pattern, _)| lower.contains(pattern))
                .map(|(_, category)| *category)
                .unwrap_or(ErrorCategory::Unknown)
        }
        OracleError::NotFound { .. } | OracleError::Auth(_) => ErrorCategory::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryStrategy {
    /// Same request, no delay.
    Simple,
    /// Shrink the request to `target_ratio` of its current size, no delay.
    Shrink { target_ratio: f64 },
    /// Same request after an exponential backoff delay.
    Backoff,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Simple => "simple",
            RetryStrategy::Shrink { .. } => "shrink",
            RetryStrategy::Backoff => "backoff",
        }
    }
}

/// One retry decision. Not persisted.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub strategy: RetryStrategy,
    pub delay: Duration,
    pub error: OracleError,
}

/// Weighted likelihood (0.0..=1.0) that a failure was caused by truncation.
///
/// `response_sizes` holds the sizes of the responses received so far for this
/// invocation, oldest first.
pub fn truncation_score(
    category: ErrorCategory,
    request_chars: usize,
    response_sizes: &[usize],
) -> f64 {
    let mut score: f64 = match category {
        ErrorCategory::JsonTruncation => 0.4,
        ErrorCategory::MalformedResponse => 0.1,
        _ => 0.0,
    };

    score += match request_chars {
        n if n > 20_000 => 0.3,
        n if n > 10_000 => 0.2,
        n if n > 5_000 => 0.1,
        _ => 0.0,
    };

    if response_sizes.len() >= 3 {
        let recent = &response_sizes[response_sizes.len() - 3..];
        if recent.windows(2).all(|w| w[1] < w[0]) {
            score += 0.2;
        }
    }

    if let Some(last) = response_sizes.last() {
        if *last < 200 {
            score += 0.1;
        }
    }

    score.min(1.0)
}

/// Choose how to retry after a recoverable failure.
pub fn select_strategy(category: ErrorCategory, score: f64, request_chars: usize) -> RetryStrategy {
    let large = request_chars >= LARGE_REQUEST_CHARS;
    match category {
        ErrorCategory::PayloadTooLarge => RetryStrategy::Shrink {
            target_ratio: AGGRESSIVE_SHRINK,
        },
        ErrorCategory::JsonTruncation if score >= HIGH_TRUNCATION_SCORE => RetryStrategy::Shrink {
            target_ratio: AGGRESSIVE_SHRINK,
        },
        ErrorCategory::JsonTruncation if large => RetryStrategy::Shrink {
            target_ratio: MODERATE_SHRINK,
        },
        ErrorCategory::JsonTruncation => RetryStrategy::Simple,
        ErrorCategory::Timeout if large => RetryStrategy::Shrink {
            target_ratio: MODERATE_SHRINK,
        },
        ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Timeout => {
            RetryStrategy::Backoff
        }
        ErrorCategory::MalformedResponse | ErrorCategory::Unknown => RetryStrategy::Simple,
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub smart_retry: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&AiSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(ai: &AiSettings) -> Self {
        Self {
            max_retries: ai.max_retries,
            smart_retry: ai.smart_retry,
            base_delay: Duration::from_millis(ai.base_delay_ms),
            max_delay: Duration::from_millis(ai.max_delay_ms),
        }
    }

    /// Total attempts allowed for one invocation.
    pub fn max_attempts(&self) -> u32 {
        if self.smart_retry {
            self.max_retries.max(1)
        } else {
            1
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// A value accepted from a response, plus whether repair was needed.
pub struct Accepted<T> {
    pub value: T,
    pub repaired: bool,
}

/// The successful result of a retried invocation.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub history: Vec<RetryAttempt>,
}

/// Runs one logical oracle invocation under a retry policy.
///
/// Parse failures reported by the `accept` callback feed back into the same
/// loop as transport failures, so truncated output can trigger a shrink.
pub struct Retrier<'a> {
    oracle: &'a dyn Oracle,
    policy: &'a RetryPolicy,
    monitor: Option<&'a ResponseMonitor>,
}

impl<'a> Retrier<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        policy: &'a RetryPolicy,
        monitor: Option<&'a ResponseMonitor>,
    ) -> Self {
        Self {
            oracle,
            policy,
            monitor,
        }
    }

    pub async fn run<T, F>(
        &self,
        prompt: Prompt,
        shape: OutputShape,
        label: &str,
        mut accept: F,
    ) -> Result<Retried<T>, OracleError>
    where
        F: FnMut(&str) -> Result<Accepted<T>, OracleError>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut current = prompt;
        let mut response_sizes: Vec<usize> = Vec::new();
        let mut history: Vec<RetryAttempt> = Vec::new();
        let mut simple_retry_used = false;
        let mut attempt: u32 = 0;

        loop {
            if current.is_omitted() {
                return Err(OracleError::PayloadTooLarge(format!(
                    "{}: request data does not fit the size budget",
                    label
                )));
            }
            attempt += 1;
            let request = current.render();
            let request_chars = request.chars().count();
            let started = Instant::now();

            let result = self.oracle.invoke(&request, shape).await;
            let latency = started.elapsed();

            let (err, response_chars) = match result {
                Ok(text) => {
                    let response_chars = text.chars().count();
                    match accept(&text) {
                        Ok(accepted) => {
                            self.record(ResponseEvent::success(
                                request_chars,
                                response_chars,
                                latency,
                                accepted.repaired || attempt > 1,
                            ));
                            debug!(label, attempt, request_chars, response_chars, "oracle call succeeded");
                            return Ok(Retried {
                                value: accepted.value,
                                attempts: attempt,
                                history,
                            });
                        }
                        Err(err) => (err, Some(response_chars)),
                    }
                }
                Err(err) => (err, None),
            };

            let category = categorize(&err);
            self.record(ResponseEvent::failure(
                request_chars,
                response_chars.unwrap_or(0),
                latency,
                category,
            ));

            if err.is_critical() || attempt >= max_attempts {
                return Err(err);
            }

            if let Some(size) = response_chars {
                response_sizes.push(size);
            }
            let score = truncation_score(category, request_chars, &response_sizes);
            let strategy = select_strategy(category, score, request_chars);

            if strategy == RetryStrategy::Simple
                && matches!(
                    category,
                    ErrorCategory::MalformedResponse | ErrorCategory::Unknown
                )
            {
                if simple_retry_used {
                    return Err(err);
                }
                simple_retry_used = true;
            }

            let delay = match strategy {
                RetryStrategy::Backoff => self.policy.backoff_delay(attempt),
                _ => Duration::ZERO,
            };

            warn!(
                label,
                attempt,
                max_attempts,
                category = %category,
                strategy = strategy.as_str(),
                truncation_score = score,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying oracle call"
            );

            if let RetryStrategy::Shrink { target_ratio } = strategy {
                let target = (request_chars as f64 * target_ratio) as usize;
                current = current.shrink_to(target.max(current.shrink_floor()));
            }

            history.push(RetryAttempt {
                attempt,
                strategy,
                delay,
                error: err,
            });

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn record(&self, event: ResponseEvent) {
        if let Some(monitor) = self.monitor {
            monitor.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::ScriptedOracle;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            smart_retry: true,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn accept_json(text: &str) -> Result<Accepted<String>, OracleError> {
        serde_json::from_str::<serde_json::Value>(text)
            .map(|_| Accepted {
                value: text.to_string(),
                repaired: false,
            })
            .map_err(|e| OracleError::Malformed(e.to_string()))
    }

    #[test]
    fn test_categorize() {
        assert_eq!(
            categorize(&OracleError::Truncated("x".into())),
            ErrorCategory::JsonTruncation
        );
        assert_eq!(
            categorize(&OracleError::Malformed("EOF while parsing a string".into())),
            ErrorCategory::JsonTruncation
        );
        assert_eq!(
            categorize(&OracleError::Malformed("expected value".into())),
            ErrorCategory::MalformedResponse
        );
        assert_eq!(
            categorize(&OracleError::Process("Connection reset by peer".into())),
            ErrorCategory::Network
        );
        assert_eq!(
            categorize(&OracleError::Process("boom".into())),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_truncation_score_weights() {
        assert!((truncation_score(ErrorCategory::JsonTruncation, 100, &[]) - 0.4).abs() < 1e-9);
        assert!(
            (truncation_score(ErrorCategory::JsonTruncation, 25_000, &[]) - 0.7).abs() < 1e-9
        );
        let shrinking = truncation_score(ErrorCategory::JsonTruncation, 100, &[900, 500, 150]);
        assert!((shrinking - 0.7).abs() < 1e-9);
        assert_eq!(truncation_score(ErrorCategory::RateLimit, 0, &[]), 0.0);
        assert!(truncation_score(ErrorCategory::JsonTruncation, 50_000, &[900, 500, 100]) <= 1.0);
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            select_strategy(ErrorCategory::PayloadTooLarge, 0.0, 100),
            RetryStrategy::Shrink { target_ratio: 0.5 }
        );
        assert_eq!(
            select_strategy(ErrorCategory::JsonTruncation, 0.8, 100),
            RetryStrategy::Shrink { target_ratio: 0.5 }
        );
        assert_eq!(
            select_strategy(ErrorCategory::JsonTruncation, 0.6, 15_000),
            RetryStrategy::Shrink { target_ratio: 0.7 }
        );
        assert_eq!(
            select_strategy(ErrorCategory::JsonTruncation, 0.4, 500),
            RetryStrategy::Simple
        );
        assert_eq!(
            select_strategy(ErrorCategory::Timeout, 0.0, 12_000),
            RetryStrategy::Shrink { target_ratio: 0.7 }
        );
        assert_eq!(
            select_strategy(ErrorCategory::Timeout, 0.0, 500),
            RetryStrategy::Backoff
        );
        assert_eq!(
            select_strategy(ErrorCategory::RateLimit, 0.0, 50_000),
            RetryStrategy::Backoff
        );
        assert_eq!(
            select_strategy(ErrorCategory::Unknown, 0.0, 500),
            RetryStrategy::Simple
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            smart_retry: true,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_max_attempts() {
        let mut policy = fast_policy(4);
        assert_eq!(policy.max_attempts(), 4);
        policy.smart_retry = false;
        assert_eq!(policy.max_attempts(), 1);
        policy.smart_retry = true;
        policy.max_retries = 0;
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test]
    async fn persistent_rate_limit_stops_at_max_attempts() {
        let oracle = ScriptedOracle::new()
            .with_fallback(Err(OracleError::RateLimited("slow down".into())));
        let policy = fast_policy(3);
        let retrier = Retrier::new(&oracle, &policy, None);
        let err = retrier
            .run(Prompt::new("H", "d"), OutputShape::Structured, "t", accept_json)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::RateLimited(_)));
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn smart_retry_disabled_means_single_attempt() {
        let oracle = ScriptedOracle::new()
            .with_fallback(Err(OracleError::Network("reset".into())));
        let mut policy = fast_policy(5);
        policy.smart_retry = false;
        let retrier = Retrier::new(&oracle, &policy, None);
        assert!(retrier
            .run(Prompt::new("H", "d"), OutputShape::Structured, "t", accept_json)
            .await
            .is_err());
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn critical_error_is_not_retried() {
        let oracle = ScriptedOracle::new().with_fallback(Err(OracleError::NotFound {
            command: "claude".into(),
        }));
        let policy = fast_policy(5);
        let retrier = Retrier::new(&oracle, &policy, None);
        let err = retrier
            .run(Prompt::new("H", "d"), OutputShape::Structured, "t", accept_json)
            .await
            .unwrap_err();
        assert!(err.is_critical());
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_gets_exactly_one_simple_retry() {
        let oracle = ScriptedOracle::new().with_fallback(Ok("not json at all".into()));
        let policy = fast_policy(5);
        let retrier = Retrier::new(&oracle, &policy, None);
        assert!(retrier
            .run(Prompt::new("H", "d"), OutputShape::Structured, "t", accept_json)
            .await
            .is_err());
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn payload_too_large_shrinks_next_request() {
        let oracle = ScriptedOracle::new().script(
            "HEADER",
            vec![
                Err(OracleError::PayloadTooLarge("too big".into())),
                Ok("[]".into()),
            ],
        );
        let policy = fast_policy(3);
        let monitor = ResponseMonitor::new(chrono::Duration::days(1));
        let retrier = Retrier::new(&oracle, &policy, Some(&monitor));
        let data = "x".repeat(2_000);
        let out = retrier
            .run(
                Prompt::new("HEADER\n", data),
                OutputShape::Structured,
                "t",
                accept_json,
            )
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(out.history.len(), 1);
        assert_eq!(
            out.history[0].strategy,
            RetryStrategy::Shrink { target_ratio: 0.5 }
        );
        let requests = oracle.requests();
        assert!(requests[1].len() < requests[0].len());
        assert!(requests[1].contains("[content truncated for retry]"));
        assert_eq!(monitor.events().len(), 2);
    }

    #[tokio::test]
    async fn omitted_request_data_fails_without_a_call() {
        let oracle = ScriptedOracle::new().with_fallback(Ok("[]".into()));
        let policy = fast_policy(3);
        let retrier = Retrier::new(&oracle, &policy, None);
        let prompt = Prompt::new("H".repeat(100), "d".repeat(100)).shrink_to(50);
        assert!(prompt.is_omitted());

        let err = retrier
            .run(prompt, OutputShape::Structured, "t", accept_json)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::PayloadTooLarge(_)));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn repeated_shrinks_keep_the_start_of_the_data() {
        let oracle = ScriptedOracle::new()
            .with_fallback(Err(OracleError::PayloadTooLarge("too big".into())));
        let policy = fast_policy(4);
        let retrier = Retrier::new(&oracle, &policy, None);
        let header = "H".repeat(3_000);
        let data = format!("comment_id: 9\n{}", "d".repeat(3_000));
        assert!(retrier
            .run(Prompt::new(header, data), OutputShape::Structured, "t", accept_json)
            .await
            .is_err());

        let requests = oracle.requests();
        assert_eq!(requests.len(), 4);
        assert!(requests
            .iter()
            .all(|r| r.contains("comment_id: 9") && !r.contains("[omitted for retry]")));
    }
}
