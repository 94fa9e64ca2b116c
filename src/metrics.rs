//! Bridge metrics
//!
//! Counts requests, errors, relayed messages and path translations for one
//! bridge session. All mutation goes through a single mutex; snapshots copy
//! the state out under the lock and do the arithmetic afterwards, so readers
//! hold it only for the copy.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

// ============================================================================
// Constants
// ============================================================================

/// Default capacity of the request and error history rings
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Number of recent durations kept per operation for latency statistics
const DURATION_WINDOW: usize = 100;

/// Number of entries included in the "recent" sections of a snapshot
const RECENT_ENTRIES: usize = 10;

/// Requests slower than this are logged as warnings
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

// ============================================================================
// Records
// ============================================================================

/// One completed request in the history ring
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub duration_ms: f64,
    pub success: bool,
}

/// One error occurrence in the history ring
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub context: Option<String>,
}

/// Which way a relayed message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Client → server
    Inbound,
    /// Server → client
    Outbound,
}

#[derive(Debug, Default, Clone)]
struct OperationCounters {
    count: u64,
    errors: u64,
    durations: VecDeque<Duration>,
}

#[derive(Debug)]
struct MetricsState {
    started_at: Instant,
    total_requests: u64,
    total_errors: u64,
    operations: BTreeMap<String, OperationCounters>,
    error_counts: BTreeMap<String, u64>,
    request_history: VecDeque<RequestRecord>,
    error_history: VecDeque<ErrorRecord>,
    path_translations: u64,
    translation_patterns: BTreeMap<String, u64>,
    messages_in: u64,
    messages_out: u64,
    restarts: u64,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: 0,
            total_errors: 0,
            operations: BTreeMap::new(),
            error_counts: BTreeMap::new(),
            request_history: VecDeque::new(),
            error_history: VecDeque::new(),
            path_translations: 0,
            translation_patterns: BTreeMap::new(),
            messages_in: 0,
            messages_out: 0,
            restarts: 0,
        }
    }
}

/// Push onto a bounded ring, evicting the oldest entry first
fn push_bounded<T>(ring: &mut VecDeque<T>, capacity: usize, item: T) {
    if capacity == 0 {
        return;
    }
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Latency statistics for one operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub recent_ms: Vec<f64>,
}

/// Path translation counters
#[derive(Debug, Clone, Serialize)]
pub struct TranslationStats {
    pub total: u64,
    pub patterns: BTreeMap<String, u64>,
}

/// Point-in-time view of the collector; derived, never persisted by the bridge
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    /// errors / max(requests, 1)
    pub error_rate: f64,
    /// requests per second of uptime
    pub throughput: f64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub restarts: u64,
    pub operations: BTreeMap<String, OperationStats>,
    pub error_counts: BTreeMap<String, u64>,
    pub path_translations: TranslationStats,
    pub recent_requests: Vec<RequestRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Request statistics over a trailing window
#[derive(Debug, Clone, Serialize)]
pub struct RecentPerformance {
    pub period_seconds: f64,
    pub request_count: usize,
    pub error_count: usize,
    pub mean_ms: f64,
    pub requests_per_second: f64,
    /// Fraction of requests in the window that succeeded (1.0 when idle)
    pub success_rate: f64,
}

// ============================================================================
// Collector
// ============================================================================

/// Concurrency-safe metrics collector
#[derive(Debug)]
pub struct BridgeMetrics {
    capacity: usize,
    state: Mutex<MetricsState>,
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl BridgeMetrics {
    /// Create a collector whose history rings hold `capacity` entries each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(MetricsState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        // Counters stay meaningful even if a writer panicked mid-update
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one completed request
    pub fn record_request(&self, method: &str, duration: Duration, success: bool) {
        {
            let mut state = self.lock();
            state.total_requests += 1;

            let op = state.operations.entry(method.to_string()).or_default();
            op.count += 1;
            if !success {
                op.errors += 1;
            }
            push_bounded(&mut op.durations, DURATION_WINDOW, duration);

            let record = RequestRecord {
                timestamp: Utc::now(),
                method: method.to_string(),
                duration_ms: millis(duration),
                success,
            };
            push_bounded(&mut state.request_history, self.capacity, record);
        }

        if duration > SLOW_REQUEST_THRESHOLD {
            warn!("Slow request: {} took {:.2}s", method, duration.as_secs_f64());
        }
    }

    /// Record one error occurrence
    pub fn record_error(&self, error_type: &str, context: Option<String>) {
        let mut state = self.lock();
        state.total_errors += 1;
        *state.error_counts.entry(error_type.to_string()).or_default() += 1;

        let record = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error_type.to_string(),
            context,
        };
        push_bounded(&mut state.error_history, self.capacity, record);
    }

    /// Record one rewritten path
    pub fn record_path_translation(&self, from: &str, to: &str) {
        let pattern = match (path_prefix(from), path_prefix(to)) {
            (Some(from), Some(to)) => Some(format!("{from} -> {to}")),
            _ => None,
        };

        let mut state = self.lock();
        state.path_translations += 1;
        if let Some(pattern) = pattern {
            *state.translation_patterns.entry(pattern).or_default() += 1;
        }
    }

    /// Count one relayed message
    pub fn record_message(&self, direction: MessageDirection) {
        let mut state = self.lock();
        match direction {
            MessageDirection::Inbound => state.messages_in += 1,
            MessageDirection::Outbound => state.messages_out += 1,
        }
    }

    /// Count one successful restart of the downstream process
    pub fn record_restart(&self) {
        self.lock().restarts += 1;
    }

    /// Start timing `operation`; the sample is recorded when the timer drops
    pub fn start_timer(&self, operation: impl Into<String>) -> ScopedTimer<'_> {
        ScopedTimer {
            metrics: self,
            operation: operation.into(),
            started: Instant::now(),
            success: false,
        }
    }

    /// Compute a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (uptime, mut snapshot, operations) = {
            let state = self.lock();
            let skip_requests = state.request_history.len().saturating_sub(RECENT_ENTRIES);
            let skip_errors = state.error_history.len().saturating_sub(RECENT_ENTRIES);

            let snapshot = MetricsSnapshot {
                uptime_seconds: 0.0,
                total_requests: state.total_requests,
                total_errors: state.total_errors,
                error_rate: 0.0,
                throughput: 0.0,
                messages_in: state.messages_in,
                messages_out: state.messages_out,
                restarts: state.restarts,
                operations: BTreeMap::new(),
                error_counts: state.error_counts.clone(),
                path_translations: TranslationStats {
                    total: state.path_translations,
                    patterns: state.translation_patterns.clone(),
                },
                recent_requests: state.request_history.iter().skip(skip_requests).cloned().collect(),
                recent_errors: state.error_history.iter().skip(skip_errors).cloned().collect(),
            };
            (state.started_at.elapsed(), snapshot, state.operations.clone())
        };

        let uptime_secs = uptime.as_secs_f64();
        snapshot.uptime_seconds = uptime_secs;
        snapshot.error_rate = snapshot.total_errors as f64 / snapshot.total_requests.max(1) as f64;
        snapshot.throughput = if uptime_secs > 0.0 {
            snapshot.total_requests as f64 / uptime_secs
        } else {
            0.0
        };
        snapshot.operations = operations
            .into_iter()
            .filter(|(_, op)| !op.durations.is_empty())
            .map(|(name, op)| (name, operation_stats(&op)))
            .collect();
        snapshot
    }

    /// Request statistics for the trailing `window`
    pub fn recent_performance(&self, window: Duration) -> RecentPerformance {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());

        let (requests, error_count): (Vec<RequestRecord>, usize) = {
            let state = self.lock();
            (
                state
                    .request_history
                    .iter()
                    .filter(|r| r.timestamp > cutoff)
                    .cloned()
                    .collect(),
                state.error_history.iter().filter(|e| e.timestamp > cutoff).count(),
            )
        };

        let period_seconds = window.as_secs_f64();
        let request_count = requests.len();
        if request_count == 0 {
            return RecentPerformance {
                period_seconds,
                request_count,
                error_count,
                mean_ms: 0.0,
                requests_per_second: 0.0,
                success_rate: 1.0,
            };
        }

        let total_ms: f64 = requests.iter().map(|r| r.duration_ms).sum();
        let succeeded = requests.iter().filter(|r| r.success).count();
        RecentPerformance {
            period_seconds,
            request_count,
            error_count,
            mean_ms: total_ms / request_count as f64,
            requests_per_second: if period_seconds > 0.0 {
                request_count as f64 / period_seconds
            } else {
                0.0
            },
            success_rate: succeeded as f64 / request_count as f64,
        }
    }

    /// Write the current snapshot to `path` as pretty JSON
    pub fn export_to_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot()).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        debug!("Metrics exported to {}", path.display());
        Ok(())
    }
}

fn operation_stats(op: &OperationCounters) -> OperationStats {
    let durations: Vec<f64> = op.durations.iter().copied().map(millis).collect();
    let sum: f64 = durations.iter().sum();
    let min = durations.iter().copied().fold(f64::INFINITY, f64::min);
    let max = durations.iter().copied().fold(0.0, f64::max);
    let skip = durations.len().saturating_sub(RECENT_ENTRIES);

    OperationStats {
        count: op.count,
        errors: op.errors,
        mean_ms: sum / durations.len() as f64,
        min_ms: min,
        max_ms: max,
        recent_ms: durations[skip..].to_vec(),
    }
}

/// Prefix pattern of a translated path: `/mnt/c/` or `C:\`
fn path_prefix(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix("/mnt/") {
        let drive = rest.chars().next().filter(char::is_ascii_alphabetic)?;
        return Some(format!("/mnt/{}/", drive.to_ascii_lowercase()));
    }
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            Some(format!("{}:\\", drive.to_ascii_uppercase()))
        }
        _ => None,
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bridge Performance Summary")?;
        writeln!(f, "Uptime: {:.1}s", self.uptime_seconds)?;
        writeln!(f, "Messages: {} in, {} out", self.messages_in, self.messages_out)?;
        writeln!(f, "Total Requests: {}", self.total_requests)?;
        writeln!(f, "Total Errors: {}", self.total_errors)?;
        writeln!(f, "Error Rate: {:.1}%", self.error_rate * 100.0)?;
        writeln!(f, "Requests/sec: {:.2}", self.throughput)?;
        writeln!(f, "Restarts: {}", self.restarts)?;
        write!(f, "Path Translations: {}", self.path_translations.total)?;

        if !self.operations.is_empty() {
            write!(f, "\nRequest Performance:")?;
            for (method, stats) in &self.operations {
                write!(
                    f,
                    "\n  {}: {} requests, avg {:.1}ms (min {:.1}ms, max {:.1}ms)",
                    method, stats.count, stats.mean_ms, stats.min_ms, stats.max_ms
                )?;
            }
        }

        if !self.error_counts.is_empty() {
            write!(f, "\nError Breakdown:")?;
            for (error_type, count) in &self.error_counts {
                write!(f, "\n  {error_type}: {count}")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scoped Timer
// ============================================================================

/// Records one request sample when dropped.
///
/// The sample counts as a failure unless [`ScopedTimer::succeed`] consumed
/// the timer, so early returns through `?` are attributed correctly.
pub struct ScopedTimer<'a> {
    metrics: &'a BridgeMetrics,
    operation: String,
    started: Instant,
    success: bool,
}

impl ScopedTimer<'_> {
    /// Mark the operation successful and record it
    pub fn succeed(mut self) {
        self.success = true;
    }

    /// Time elapsed since the timer started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_request(&self.operation, self.started.elapsed(), self.success);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_request_statistics() {
        let metrics = BridgeMetrics::new(100);
        metrics.record_request("tools/call", Duration::from_millis(10), true);
        metrics.record_request("tools/call", Duration::from_millis(30), false);
        metrics.record_request("ping", Duration::from_millis(2), true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);

        let call = &snapshot.operations["tools/call"];
        assert_eq!(call.count, 2);
        assert_eq!(call.errors, 1);
        assert!((call.mean_ms - 20.0).abs() < 1e-6);
        assert!((call.min_ms - 10.0).abs() < 1e-6);
        assert!((call.max_ms - 30.0).abs() < 1e-6);
        assert_eq!(snapshot.operations["ping"].count, 1);
    }

    #[test]
    fn test_error_rate_uses_max_requests_one() {
        let metrics = BridgeMetrics::new(100);
        metrics.record_error("stream_error", None);
        metrics.record_error("stream_error", Some("broken pipe".to_string()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_errors, 2);
        assert!((snapshot.error_rate - 2.0).abs() < 1e-9);
        assert_eq!(snapshot.error_counts["stream_error"], 2);

        metrics.record_request("a", Duration::ZERO, true);
        metrics.record_request("b", Duration::ZERO, true);
        metrics.record_request("c", Duration::ZERO, true);
        metrics.record_request("d", Duration::ZERO, true);
        assert!((metrics.snapshot().error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_history_rings_evict_oldest_first() {
        let metrics = BridgeMetrics::new(3);
        for i in 0..5 {
            metrics.record_request(&format!("m{i}"), Duration::ZERO, true);
            metrics.record_error(&format!("e{i}"), None);
        }

        let state = metrics.lock();
        let methods: Vec<_> = state.request_history.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, vec!["m2", "m3", "m4"]);
        let errors: Vec<_> = state.error_history.iter().map(|e| e.error_type.as_str()).collect();
        assert_eq!(errors, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_duration_window_is_bounded() {
        let metrics = BridgeMetrics::new(10);
        for i in 0..150 {
            metrics.record_request("op", Duration::from_millis(i), true);
        }
        let snapshot = metrics.snapshot();
        let op = &snapshot.operations["op"];
        assert_eq!(op.count, 150);
        assert!((op.min_ms - 50.0).abs() < 1e-6);
        assert_eq!(op.recent_ms.len(), RECENT_ENTRIES);
        assert_eq!(snapshot.recent_requests.len(), RECENT_ENTRIES);
    }

    #[test]
    fn test_scoped_timer_attributes_outcome() {
        let metrics = BridgeMetrics::new(10);

        metrics.start_timer("ok_op").succeed();

        fn failing(metrics: &BridgeMetrics) -> Result<(), &'static str> {
            let timer = metrics.start_timer("failing_op");
            Err("early exit")?;
            timer.succeed();
            Ok(())
        }
        assert!(failing(&metrics).is_err());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations["ok_op"].errors, 0);
        assert_eq!(snapshot.operations["failing_op"].errors, 1);
        assert_eq!(snapshot.total_requests, 2);
    }

    #[test]
    fn test_path_translation_patterns() {
        let metrics = BridgeMetrics::new(10);
        metrics.record_path_translation("/mnt/c/a", r"C:\a");
        metrics.record_path_translation("/mnt/c/b", r"C:\b");
        metrics.record_path_translation(r"D:\x", "/mnt/d/x");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.path_translations.total, 3);
        assert_eq!(snapshot.path_translations.patterns[r"/mnt/c/ -> C:\"], 2);
        assert_eq!(snapshot.path_translations.patterns[r"D:\ -> /mnt/d/"], 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let metrics = Arc::new(BridgeMetrics::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        metrics.record_message(MessageDirection::Inbound);
                        metrics.record_request("op", Duration::from_micros(5), true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_in, 4000);
        assert_eq!(snapshot.total_requests, 4000);
    }

    #[test]
    fn test_recent_performance_window() {
        let metrics = BridgeMetrics::new(10);
        assert_eq!(metrics.recent_performance(Duration::from_secs(60)).request_count, 0);

        metrics.record_request("a", Duration::from_millis(4), true);
        metrics.record_request("a", Duration::from_millis(8), false);
        let recent = metrics.recent_performance(Duration::from_secs(60));
        assert_eq!(recent.request_count, 2);
        assert!((recent.mean_ms - 6.0).abs() < 1e-6);
        assert!((recent.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_summary_and_export() {
        let metrics = BridgeMetrics::new(10);
        metrics.record_request("tools/list", Duration::from_millis(12), true);
        metrics.record_error("translation_error", None);

        let summary = metrics.snapshot().to_string();
        assert!(summary.contains("Total Requests: 1"));
        assert!(summary.contains("tools/list: 1 requests"));
        assert!(summary.contains("translation_error: 1"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        metrics.export_to_file(&path).unwrap();
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported["total_requests"], 1);
        assert_eq!(exported["total_errors"], 1);
    }
}
