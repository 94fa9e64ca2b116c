//! Bridge session state
//!
//! [`BridgeSession`] is the aggregate every bridge task shares: the selected
//! server, the effective policy, the current process handle, the restart
//! bookkeeping and the shutdown flag.
//!
//! The current handle lives in an `ArcSwapOption`. The supervisor exchanges
//! it wholesale on restart; pumps load it fresh on every iteration and may
//! briefly keep using a stale one, which then reads as EOF or refuses writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use crate::bridge::config::{BridgeConfig, BridgePolicy, ServerDescriptor};
use crate::bridge::shutdown::ShutdownSignal;
use crate::io::ProcessHandle;
use crate::jsonrpc::{self, MessageKind, RequestId};
use crate::metrics::BridgeMetrics;
use crate::translate::PathTranslator;

/// Upper bound on requests awaiting a response
const MAX_PENDING_REQUESTS: usize = 10_000;

/// `bridge_<pid>_<unix-seconds>`
pub fn generate_workspace_id() -> String {
    format!(
        "bridge_{}_{}",
        std::process::id(),
        chrono::Utc::now().timestamp()
    )
}

// ============================================================================
// Timings
// ============================================================================

/// Fixed intervals used by the supervisor and the relay pumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimings {
    /// How long a fresh process must survive to count as started
    pub startup_grace: Duration,
    /// Liveness polling period of the health-check loop
    pub health_period: Duration,
    /// Sleep of an idle pump waiting for a live handle
    pub idle_poll: Duration,
    /// Time a process gets to exit after SIGTERM before it is killed
    pub terminate_timeout: Duration,
    /// Bound on reading a dead process's stderr after a failed start
    pub stderr_capture_timeout: Duration,
}

impl Default for BridgeTimings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(500),
            health_period: Duration::from_secs(5),
            idle_poll: Duration::from_millis(100),
            terminate_timeout: Duration::from_secs(5),
            stderr_capture_timeout: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Restart State
// ============================================================================

/// What the restart policy allows right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// The last restart was too recent; skip this cycle
    CooldownActive { remaining: Duration },
    /// The restart budget is spent
    Exhausted,
    /// Restart; `attempt` is the new restart count
    Proceed { attempt: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartState {
    /// Restarts performed so far; never decreases
    pub restart_count: u32,
    /// When the last restart was attempted
    pub last_restart_time: Option<Instant>,
}

impl RestartState {
    /// Apply the restart policy at `now`.
    ///
    /// Cooldown is checked before the budget. The first restart is never
    /// held back by cooldown.
    pub fn evaluate(&self, policy: &BridgePolicy, now: Instant) -> RestartDecision {
        if let Some(last) = self.last_restart_time {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < policy.restart_cooldown {
                return RestartDecision::CooldownActive {
                    remaining: policy.restart_cooldown - elapsed,
                };
            }
        }
        if self.restart_count >= policy.max_restarts {
            return RestartDecision::Exhausted;
        }
        RestartDecision::Proceed {
            attempt: self.restart_count + 1,
        }
    }

    fn record_attempt(&mut self, now: Instant) -> u32 {
        self.restart_count += 1;
        self.last_restart_time = Some(now);
        self.restart_count
    }
}

// ============================================================================
// Request Tracking
// ============================================================================

#[derive(Debug)]
struct PendingRequest {
    method: String,
    started: Instant,
}

/// Pairs client requests with server responses to time them
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestTracker {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember a client → server request
    pub fn observe_inbound(&self, frame: &[u8]) {
        if let Some(MessageKind::Request { id, method }) = jsonrpc::classify(frame) {
            let mut pending = self.pending();
            if pending.len() >= MAX_PENDING_REQUESTS {
                debug!("Not tracking request {}: too many pending requests", id);
                return;
            }
            pending.insert(
                id,
                PendingRequest {
                    method,
                    started: Instant::now(),
                },
            );
        }
    }

    /// Complete a request when its response passes server → client
    pub fn observe_outbound(&self, frame: &[u8], metrics: &BridgeMetrics) {
        if let Some(MessageKind::Response { id, is_error }) = jsonrpc::classify(frame) {
            let completed = self.pending().remove(&id);
            if let Some(request) = completed {
                metrics.record_request(&request.method, request.started.elapsed(), !is_error);
            }
        }
    }

    /// Forget every pending request, recording each as dropped.
    ///
    /// Returns how many were abandoned.
    pub fn abandon_all(&self, metrics: &BridgeMetrics) -> usize {
        let abandoned: Vec<(RequestId, PendingRequest)> = self.pending().drain().collect();
        for (id, request) in &abandoned {
            metrics.record_request(&request.method, request.started.elapsed(), false);
            metrics.record_error(
                "dropped_by_restart",
                Some(format!("{} (id {})", request.method, id)),
            );
        }
        if !abandoned.is_empty() {
            warn!(
                "{} in-flight request(s) lost with the previous server process",
                abandoned.len()
            );
        }
        abandoned.len()
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Shared state of one bridge instance
#[derive(Debug)]
pub struct BridgeSession {
    workspace_id: String,
    server_name: String,
    descriptor: ServerDescriptor,
    policy: BridgePolicy,
    timings: BridgeTimings,
    current: ArcSwapOption<ProcessHandle>,
    restart: Mutex<RestartState>,
    shutdown: ShutdownSignal,
    metrics: Arc<BridgeMetrics>,
    translator: PathTranslator,
    requests: RequestTracker,
    started_at: Instant,
}

impl BridgeSession {
    pub fn new(
        workspace_id: impl Into<String>,
        config: &BridgeConfig,
        timings: BridgeTimings,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let translator =
            PathTranslator::new(config.policy.translate_paths, config.policy.translation_mode)
                .with_metrics(Arc::clone(&metrics));

        Self {
            workspace_id: workspace_id.into(),
            server_name: config.server_name.clone(),
            descriptor: config.descriptor.clone(),
            policy: config.policy.clone(),
            timings,
            current: ArcSwapOption::empty(),
            restart: Mutex::new(RestartState::default()),
            shutdown: ShutdownSignal::new(),
            metrics,
            translator,
            requests: RequestTracker::default(),
            started_at: Instant::now(),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    pub fn timings(&self) -> &BridgeTimings {
        &self.timings
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The current process handle, if any
    pub fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.current.load_full()
    }

    /// Install `handle` as current, returning the one it replaced
    pub(crate) fn replace_current(&self, handle: Arc<ProcessHandle>) -> Option<Arc<ProcessHandle>> {
        self.current.swap(Some(handle))
    }

    /// Remove the current handle, leaving none
    pub(crate) fn take_current(&self) -> Option<Arc<ProcessHandle>> {
        self.current.swap(None)
    }

    pub fn restart_state(&self) -> RestartState {
        *self.restart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate the restart policy and, if it allows, count the attempt
    pub(crate) fn begin_restart(&self, now: Instant) -> RestartDecision {
        let mut state = self.restart.lock().unwrap_or_else(PoisonError::into_inner);
        let decision = state.evaluate(&self.policy, now);
        if let RestartDecision::Proceed { .. } = decision {
            state.record_attempt(now);
        }
        decision
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::config::ConfigSource;

    fn policy(max_restarts: u32, cooldown_secs: u64) -> BridgePolicy {
        BridgePolicy {
            max_restarts,
            restart_cooldown: Duration::from_secs(cooldown_secs),
            ..BridgePolicy::default()
        }
    }

    fn config(policy: BridgePolicy) -> BridgeConfig {
        BridgeConfig {
            server_name: "test".to_string(),
            descriptor: ServerDescriptor::new("cat"),
            policy,
            source: ConfigSource::File("test.json".into()),
        }
    }

    #[test]
    fn test_workspace_id_format() {
        let id = generate_workspace_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "bridge");
        assert_eq!(parts[1], std::process::id().to_string());
        assert!(parts[2].parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_first_restart_ignores_cooldown() {
        let state = RestartState::default();
        assert_eq!(
            state.evaluate(&policy(3, 10), Instant::now()),
            RestartDecision::Proceed { attempt: 1 }
        );
    }

    #[test]
    fn test_cooldown_checked_before_budget() {
        let now = Instant::now();
        let state = RestartState {
            restart_count: 3,
            last_restart_time: Some(now),
        };
        let decision = state.evaluate(&policy(3, 10), now + Duration::from_secs(4));
        assert_eq!(
            decision,
            RestartDecision::CooldownActive {
                remaining: Duration::from_secs(6)
            }
        );
        assert_eq!(
            state.evaluate(&policy(3, 10), now + Duration::from_secs(10)),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn test_zero_budget_is_exhausted_immediately() {
        assert_eq!(
            RestartState::default().evaluate(&policy(0, 0), Instant::now()),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn test_begin_restart_counts_attempts() {
        let session = BridgeSession::new(
            "ws",
            &config(policy(2, 0)),
            BridgeTimings::default(),
            Arc::new(BridgeMetrics::default()),
        );
        let now = Instant::now();

        assert_eq!(
            session.begin_restart(now),
            RestartDecision::Proceed { attempt: 1 }
        );
        assert_eq!(
            session.begin_restart(now),
            RestartDecision::Proceed { attempt: 2 }
        );
        assert_eq!(session.begin_restart(now), RestartDecision::Exhausted);
        assert_eq!(session.restart_state().restart_count, 2);
    }

    #[test]
    fn test_cooldown_blocks_second_restart() {
        let session = BridgeSession::new(
            "ws",
            &config(policy(3, 10)),
            BridgeTimings::default(),
            Arc::new(BridgeMetrics::default()),
        );
        let now = Instant::now();

        assert!(matches!(
            session.begin_restart(now),
            RestartDecision::Proceed { attempt: 1 }
        ));
        assert!(matches!(
            session.begin_restart(now + Duration::from_secs(2)),
            RestartDecision::CooldownActive { .. }
        ));
        assert_eq!(session.restart_state().restart_count, 1);
    }

    #[test]
    fn test_request_tracker_times_responses() {
        let metrics = BridgeMetrics::new(10);
        let tracker = RequestTracker::default();

        tracker.observe_inbound(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        tracker.observe_inbound(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
        assert_eq!(tracker.pending_count(), 1);

        tracker.observe_outbound(br#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#, &metrics);
        assert_eq!(tracker.pending_count(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations["tools/list"].count, 1);
        assert_eq!(snapshot.operations["tools/list"].errors, 0);
    }

    #[test]
    fn test_request_tracker_abandons_on_restart() {
        let metrics = BridgeMetrics::new(10);
        let tracker = RequestTracker::default();

        tracker.observe_inbound(br#"{"jsonrpc":"2.0","id":"a","method":"tools/call"}"#);
        tracker.observe_inbound(br#"{"jsonrpc":"2.0","id":"b","method":"tools/call"}"#);
        assert_eq!(tracker.abandon_all(&metrics), 2);
        assert_eq!(tracker.pending_count(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.error_counts["dropped_by_restart"], 2);
        assert_eq!(snapshot.operations["tools/call"].errors, 2);

        // A late response for a forgotten request is ignored
        tracker.observe_outbound(br#"{"jsonrpc":"2.0","id":"a","result":1}"#, &metrics);
        assert_eq!(metrics.snapshot().total_requests, 2);
    }
}
