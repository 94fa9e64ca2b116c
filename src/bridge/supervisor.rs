//! Process supervisor
//!
//! Owns the downstream process lifecycle: start with a grace interval,
//! periodic liveness polling, restart under the session's policy, and
//! graceful-then-forced termination.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{Level, debug, error, info, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::session::{BridgeSession, RestartDecision};
use crate::bridge::shutdown::ShutdownReason;
use crate::io::{ClientWriter, ProcessExit, ProcessHandle, ProcessState, TerminationOutcome};
use crate::jsonrpc;
use crate::log_timing;

/// Window of the request statistics in the periodic debug line
const RECENT_STATS_WINDOW: Duration = Duration::from_secs(60);

/// Result of one health-check cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The process is alive (or there is nothing to check)
    Healthy,
    /// The process died and a replacement is running
    Recovered { restart_count: u32 },
    /// The process is dead but no restart happened this cycle
    Deferred,
    /// Supervision has ended; the shutdown flag is set
    Stopped,
}

pub struct Supervisor {
    session: Arc<BridgeSession>,
    terminated: AtomicBool,
}

impl Supervisor {
    pub fn new(session: Arc<BridgeSession>) -> Self {
        Self {
            session,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    /// Spawn the downstream process and install it as current.
    ///
    /// The process must survive the startup grace interval; if it exits
    /// first, its stderr is captured into the returned error. The dead handle
    /// still becomes current so the next health check can apply the
    /// restart policy to it.
    pub async fn start(&self) -> Result<Arc<ProcessHandle>, BridgeError> {
        let session = &self.session;
        let timer = session.metrics().start_timer("server_start");
        let generation = session.restart_state().restart_count;

        info!(
            "Starting {} server for workspace {}",
            session.server_name(),
            session.workspace_id()
        );

        let handle = Arc::new(ProcessHandle::spawn(session.descriptor(), generation)?);
        // The previous handle was reaped by the health check that led here
        drop(session.replace_current(Arc::clone(&handle)));

        // `terminate` may have emptied the slot before the swap above
        if self.stopping() {
            return Err(self.abandon_start(&handle).await);
        }

        tokio::time::sleep(session.timings().startup_grace).await;

        if self.stopping() {
            return Err(self.abandon_start(&handle).await);
        }

        if let Some(exit) = handle.try_exit()? {
            let stderr = handle
                .drain_stderr(session.timings().stderr_capture_timeout)
                .await;
            error!("Server failed to start. {}", exit);
            if !stderr.is_empty() {
                error!("Server stderr: {}", stderr);
            }
            return Err(BridgeError::startup(exit.code, stderr));
        }

        log_timing!(Level::DEBUG, "server_start", timer.elapsed());
        timer.succeed();
        info!(
            "Successfully started {} server (PID: {})",
            session.server_name(),
            handle.pid()
        );
        Ok(handle)
    }

    fn stopping(&self) -> bool {
        self.terminated.load(Ordering::SeqCst) || self.session.shutdown().is_triggered()
    }

    /// Stop a process whose start was overtaken by shutdown
    async fn abandon_start(&self, handle: &Arc<ProcessHandle>) -> BridgeError {
        let session = &self.session;
        warn!(
            "Shutdown requested while starting server process {}, stopping it",
            handle.pid()
        );

        if let Some(current) = session.take_current() {
            if !Arc::ptr_eq(&current, handle) {
                debug!("Also stopping server process {}", current.pid());
                if let Err(e) = current.terminate(session.timings().terminate_timeout).await {
                    warn!("Failed to stop server process {}: {}", current.pid(), e);
                }
            }
        }
        // A concurrent `terminate` may already be stopping it; both calls
        // settle on the same exit
        if let Err(e) = handle.terminate(session.timings().terminate_timeout).await {
            warn!("Failed to stop server process {}: {}", handle.pid(), e);
        }

        BridgeError::Cancelled { pid: handle.pid() }
    }

    /// Poll liveness every health period until shutdown.
    ///
    /// The wait is a select on the shutdown token, so shutdown is observed
    /// immediately rather than at the end of the period.
    pub async fn health_check_loop(&self, writer: ClientWriter) {
        let session = &self.session;
        debug!("Starting health check loop");

        loop {
            tokio::select! {
                _ = session.shutdown().cancelled() => break,
                _ = tokio::time::sleep(session.timings().health_period) => {}
            }

            if session.policy().debug {
                let snapshot = session.metrics().snapshot();
                let recent = session.metrics().recent_performance(RECENT_STATS_WINDOW);
                debug!(
                    "Stats: uptime={}s, messages_in={}, messages_out={}, restarts={}, last {}s: {} requests, {:.1}ms mean, {:.0}% ok",
                    session.uptime().as_secs(),
                    snapshot.messages_in,
                    snapshot.messages_out,
                    session.restart_state().restart_count,
                    RECENT_STATS_WINDOW.as_secs(),
                    recent.request_count,
                    recent.mean_ms,
                    recent.success_rate * 100.0
                );
            }

            if self.check_once(&writer).await == HealthOutcome::Stopped {
                break;
            }
        }

        debug!("Health check loop finished");
    }

    /// One liveness check, restarting the process if policy allows
    pub async fn check_once(&self, writer: &ClientWriter) -> HealthOutcome {
        let session = &self.session;
        if session.shutdown().is_triggered() {
            return HealthOutcome::Stopped;
        }

        let Some(handle) = session.current() else {
            return HealthOutcome::Healthy;
        };
        if matches!(
            handle.state(),
            ProcessState::Terminating | ProcessState::Terminated
        ) {
            return HealthOutcome::Stopped;
        }

        let first_seen = handle.state().is_running();
        let exit = match handle.try_exit() {
            Ok(Some(exit)) => exit,
            Ok(None) => return HealthOutcome::Healthy,
            Err(e) => {
                warn!("Could not poll server process {}: {}", handle.pid(), e);
                return HealthOutcome::Healthy;
            }
        };

        // A dead handle stays current through cooldown; report its death once
        if first_seen {
            if exit.success() {
                warn!(
                    "Server process {} exited after {:?}: {}",
                    handle.pid(),
                    handle.uptime(),
                    exit
                );
            } else {
                error!(
                    "Server process {} died after {:?}: {}",
                    handle.pid(),
                    handle.uptime(),
                    exit
                );
            }
            session
                .metrics()
                .record_error("process_exit", Some(exit.to_string()));
        }

        match session.begin_restart(Instant::now()) {
            RestartDecision::CooldownActive { remaining } => {
                warn!(
                    "Restart cooldown active ({:?}), retrying in {:.1}s",
                    session.policy().restart_cooldown,
                    remaining.as_secs_f64()
                );
                HealthOutcome::Deferred
            }
            RestartDecision::Exhausted => {
                let max_restarts = session.policy().max_restarts;
                let err = BridgeError::RestartExhausted { max_restarts };
                error!("{}", err);
                session.metrics().record_error(err.kind(), None);
                session
                    .shutdown()
                    .trigger(ShutdownReason::RestartsExhausted { max_restarts });
                HealthOutcome::Stopped
            }
            RestartDecision::Proceed { attempt } => self.restart(exit, attempt, writer).await,
        }
    }

    async fn restart(&self, exit: ProcessExit, attempt: u32, writer: &ClientWriter) -> HealthOutcome {
        let session = &self.session;
        info!(
            "Attempting restart {}/{}",
            attempt,
            session.policy().max_restarts
        );
        session.requests().abandon_all(session.metrics());

        match self.start().await {
            Ok(handle) => {
                info!("Server restarted successfully (PID: {})", handle.pid());
                session.metrics().record_restart();
                self.notify_restarted(exit, attempt, writer);
                HealthOutcome::Recovered {
                    restart_count: attempt,
                }
            }
            Err(e @ BridgeError::Cancelled { .. }) => {
                info!("{}", e);
                HealthOutcome::Stopped
            }
            Err(e @ BridgeError::Startup { .. }) => {
                // Counts as an attempt; the next cycle re-applies the policy
                warn!("Restarted server exited during startup: {}", e);
                session.metrics().record_error(e.kind(), Some(e.to_string()));
                HealthOutcome::Deferred
            }
            Err(e) => {
                error!("Failed to restart server: {}", e);
                session.metrics().record_error(e.kind(), Some(e.to_string()));
                session.shutdown().trigger(ShutdownReason::RestartFailed {
                    message: e.to_string(),
                });
                HealthOutcome::Stopped
            }
        }
    }

    fn notify_restarted(&self, exit: ProcessExit, restart_count: u32, writer: &ClientWriter) {
        let notification = jsonrpc::restarted_notification(exit.to_string(), restart_count);
        match notification.to_line() {
            Ok(line) => {
                if writer.send_line(line).is_err() {
                    warn!("Client output closed, restart notification not delivered");
                }
            }
            Err(e) => error!("Failed to serialize restart notification: {}", e),
        }
    }

    /// Stop the current process. Only the first call does anything.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!("Supervisor already terminated");
            return;
        }

        let Some(handle) = self.session.take_current() else {
            return;
        };
        let timeout = self.session.timings().terminate_timeout;

        info!("Terminating server process {}...", handle.pid());
        match handle.terminate(timeout).await {
            Ok(TerminationOutcome::AlreadyExited(exit)) => {
                info!("Server process had already exited ({})", exit)
            }
            Ok(TerminationOutcome::Graceful(exit)) => {
                info!("Server terminated gracefully ({})", exit)
            }
            Ok(TerminationOutcome::Forced) => warn!("Server didn't terminate, killed it"),
            Err(e) => {
                let err = BridgeError::termination(handle.pid(), e.to_string());
                error!("{}", err);
                self.session
                    .metrics()
                    .record_error(err.kind(), Some(err.to_string()));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
