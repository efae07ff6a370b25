//! Response monitor
//!
//! Passively records every oracle invocation and derives an empirical request
//! size budget from observed truncation. The monitor is constructed once per
//! process, shared by reference, and flushed through `Storage` on exit.

use crate::retry::ErrorCategory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Samples needed before a budget is recommended.
const MIN_SAMPLES_FOR_BUDGET: usize = 5;
/// Fraction of the smallest size-related failure considered safe.
const BUDGET_SAFETY_FACTOR: f64 = 0.8;
const MIN_BUDGET_CHARS: usize = 1_000;
/// Upper bound on retained events regardless of age.
const MAX_EVENTS: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub timestamp: DateTime<Utc>,
    pub request_chars: usize,
    pub response_chars: usize,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    /// Repair or a retry was needed to get a usable response.
    #[serde(default)]
    pub recovered: bool,
}

impl ResponseEvent {
    pub fn success(
        request_chars: usize,
        response_chars: usize,
        latency: std::time::Duration,
        recovered: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_chars,
            response_chars,
            latency_ms: latency.as_millis() as u64,
            success: true,
            error_category: None,
            recovered,
        }
    }

    pub fn failure(
        request_chars: usize,
        response_chars: usize,
        latency: std::time::Duration,
        category: ErrorCategory,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_chars,
            response_chars,
            latency_ms: latency.as_millis() as u64,
            success: false,
            error_category: Some(category),
            recovered: false,
        }
    }

    fn is_size_failure(&self) -> bool {
        matches!(
            self.error_category,
            Some(ErrorCategory::JsonTruncation) | Some(ErrorCategory::PayloadTooLarge)
        )
    }
}

pub struct ResponseMonitor {
    events: Mutex<VecDeque<ResponseEvent>>,
    retention: Duration,
}

impl ResponseMonitor {
    pub fn new(retention: Duration) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    /// Seed the monitor with previously persisted events, dropping expired ones.
    pub fn with_events(events: Vec<ResponseEvent>, retention: Duration) -> Self {
        let monitor = Self::new(retention);
        {
            let mut guard = monitor.lock();
            guard.extend(events);
            Self::prune(&mut guard, retention);
        }
        monitor
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ResponseEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(events: &mut VecDeque<ResponseEvent>, retention: Duration) {
        let cutoff = Utc::now() - retention;
        while events.front().is_some_and(|e| e.timestamp < cutoff) {
            events.pop_front();
        }
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
    }

    pub fn record(&self, event: ResponseEvent) {
        let mut events = self.lock();
        events.push_back(event);
        Self::prune(&mut events, self.retention);
    }

    /// Time-ordered snapshot of the retained events.
    pub fn events(&self) -> Vec<ResponseEvent> {
        let mut events = self.lock();
        Self::prune(&mut events, self.retention);
        events.iter().cloned().collect()
    }

    /// Largest request size considered safe, once enough evidence exists.
    ///
    /// `None` means no size-related failure has been observed in the window.
    pub fn recommended_request_budget(&self) -> Option<usize> {
        let events = self.events();
        recommended_budget(&events)
    }

    pub fn report(&self) -> AnalyticsReport {
        AnalyticsReport::from_events(&self.events())
    }
}

fn recommended_budget(events: &[ResponseEvent]) -> Option<usize> {
    if events.len() < MIN_SAMPLES_FOR_BUDGET {
        return None;
    }
    let smallest_failure = events
        .iter()
        .filter(|e| e.is_size_failure())
        .map(|e| e.request_chars)
        .min()?;
    let budget = (smallest_failure as f64 * BUDGET_SAFETY_FACTOR) as usize;
    Some(budget.max(MIN_BUDGET_CHARS))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub total: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub avg_request_chars: f64,
    pub avg_response_chars: f64,
    pub truncation_rate: f64,
    pub recovered: usize,
    pub p50_latency_ms: u64,
    pub p90_latency_ms: u64,
    pub categories: BTreeMap<ErrorCategory, usize>,
    pub recommended_budget: Option<usize>,
}

impl AnalyticsReport {
    pub fn from_events(events: &[ResponseEvent]) -> Self {
        let total = events.len();
        let successes = events.iter().filter(|e| e.success).count();
        let truncations = events
            .iter()
            .filter(|e| e.error_category == Some(ErrorCategory::JsonTruncation))
            .count();

        let mut categories = BTreeMap::new();
        for category in events.iter().filter_map(|e| e.error_category) {
            *categories.entry(category).or_insert(0) += 1;
        }

        let mut latencies: Vec<u64> = events.iter().map(|e| e.latency_ms).collect();
        latencies.sort_unstable();

        Self {
            total,
            successes,
            success_rate: ratio(successes, total),
            avg_request_chars: mean(events.iter().map(|e| e.request_chars)),
            avg_response_chars: mean(events.iter().filter(|e| e.success).map(|e| e.response_chars)),
            truncation_rate: ratio(truncations, total),
            recovered: events.iter().filter(|e| e.recovered).count(),
            p50_latency_ms: percentile(&latencies, 0.5),
            p90_latency_ms: percentile(&latencies, 0.9),
            categories,
            recommended_budget: recommended_budget(events),
        }
    }
}

impl fmt::Display for AnalyticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return writeln!(f, "No oracle calls recorded in the retention window.");
        }
        writeln!(f, "Oracle calls:        {}", self.total)?;
        writeln!(
            f,
            "Success rate:        {:.1}% ({} ok, {} recovered)",
            self.success_rate * 100.0,
            self.successes,
            self.recovered
        )?;
        writeln!(f, "Avg request size:    {:.0} chars", self.avg_request_chars)?;
        writeln!(f, "Avg response size:   {:.0} chars", self.avg_response_chars)?;
        writeln!(f, "Truncation rate:     {:.1}%", self.truncation_rate * 100.0)?;
        writeln!(
            f,
            "Latency p50 / p90:   {} ms / {} ms",
            self.p50_latency_ms, self.p90_latency_ms
        )?;
        if !self.categories.is_empty() {
            writeln!(f, "Failures by category:")?;
            for (category, count) in &self.categories {
                writeln!(f, "  {:<20} {}", category.as_str(), count)?;
            }
        }
        match self.recommended_budget {
            Some(budget) => writeln!(f, "Recommended budget:  {} chars", budget),
            None => writeln!(f, "Recommended budget:  (no size limit observed)"),
        }
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn mean(values: impl Iterator<Item = usize>) -> f64 {
    let (sum, count) = values.fold((0usize, 0usize), |(s, c), v| (s + v, c + 1));
    ratio(sum, count)
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn ok(req: usize, resp: usize, ms: u64) -> ResponseEvent {
        ResponseEvent::success(req, resp, StdDuration::from_millis(ms), false)
    }

    fn failed(req: usize, category: ErrorCategory) -> ResponseEvent {
        ResponseEvent::failure(req, 0, StdDuration::from_millis(10), category)
    }

    #[test]
    fn budget_needs_enough_samples_and_a_size_failure() {
        let monitor = ResponseMonitor::new(Duration::days(1));
        for _ in 0..4 {
            monitor.record(ok(1_000, 100, 5));
        }
        monitor.record(failed(20_000, ErrorCategory::JsonTruncation));
        assert_eq!(monitor.recommended_request_budget(), Some(16_000));

        let quiet = ResponseMonitor::new(Duration::days(1));
        for _ in 0..10 {
            quiet.record(ok(1_000, 100, 5));
        }
        quiet.record(failed(500, ErrorCategory::RateLimit));
        assert_eq!(quiet.recommended_request_budget(), None);
    }

    #[test]
    fn expired_events_are_dropped() {
        let mut old = ok(10, 10, 1);
        old.timestamp = Utc::now() - Duration::days(40);
        let monitor = ResponseMonitor::with_events(vec![old, ok(20, 20, 1)], Duration::days(30));
        let events = monitor.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_chars, 20);
    }

    #[test]
    fn report_aggregates_rates_and_latency() {
        let events = vec![
            ok(100, 50, 10),
            ok(300, 150, 20),
            failed(400, ErrorCategory::JsonTruncation),
            failed(400, ErrorCategory::RateLimit),
        ];
        let report = AnalyticsReport::from_events(&events);
        assert_eq!(report.total, 4);
        assert!((report.success_rate - 0.5).abs() < 1e-9);
        assert!((report.truncation_rate - 0.25).abs() < 1e-9);
        assert!((report.avg_request_chars - 300.0).abs() < 1e-9);
        assert!((report.avg_response_chars - 100.0).abs() < 1e-9);
        assert_eq!(report.p50_latency_ms, 10);
        assert_eq!(report.p90_latency_ms, 20);
        assert_eq!(report.categories.get(&ErrorCategory::RateLimit), Some(&1));
        assert!(report.to_string().contains("Truncation rate"));
    }

    #[test]
    fn empty_report_renders() {
        let report = AnalyticsReport::from_events(&[]);
        assert_eq!(report.success_rate, 0.0);
        assert!(report.to_string().contains("No oracle calls"));
    }
}
