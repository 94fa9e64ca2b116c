//! Bridge controller
//!
//! Wires a session together: starts the server, launches the pumps and the
//! health check inside the session span, waits for the shutdown flag, then
//! tears everything down exactly once.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::relay;
use crate::bridge::session::BridgeSession;
use crate::bridge::shutdown::{self, ShutdownReason};
use crate::bridge::supervisor::Supervisor;
use crate::io::ClientWriter;
use crate::logging::LogHandle;

/// How long finished tasks get to wind down after shutdown
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Options that only matter to the controller
#[derive(Debug, Default)]
pub struct ControllerOptions {
    /// Install SIGINT/SIGTERM handlers
    pub handle_signals: bool,
    /// Write the final metrics snapshot here
    pub metrics_file: Option<PathBuf>,
}

pub struct BridgeController {
    session: Arc<BridgeSession>,
    supervisor: Arc<Supervisor>,
    options: ControllerOptions,
    log_handle: Mutex<Option<LogHandle>>,
    shutdown_done: AtomicBool,
}

impl BridgeController {
    pub fn new(session: Arc<BridgeSession>, options: ControllerOptions) -> Self {
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&session)));
        Self {
            session,
            supervisor,
            options,
            log_handle: Mutex::new(None),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Hand over the log file so shutdown can flush it
    pub fn with_log_handle(self, handle: LogHandle) -> Self {
        *self.log_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self
    }

    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    /// Run the bridge between `input` and `output` until shutdown.
    ///
    /// Fails only if the first start fails; every later failure ends the
    /// session through the shutdown flag and is reported as its reason.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<ShutdownReason, BridgeError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!("bridge", workspace_id = %self.session.workspace_id());
        self.run_session(input, output).instrument(span).await
    }

    async fn run_session<R, W>(&self, input: R, output: W) -> Result<ShutdownReason, BridgeError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = &self.session;
        let policy = session.policy();
        info!("Workspace isolation bridge starting...");
        info!(
            "Settings: server={}, debug={}, max_restarts={}, restart_cooldown={:?}, translate_paths={} ({:?})",
            session.server_name(),
            policy.debug,
            policy.max_restarts,
            policy.restart_cooldown,
            policy.translate_paths,
            policy.translation_mode
        );

        match self.supervisor.start().await {
            Ok(_) => {}
            Err(e @ BridgeError::Cancelled { .. }) => {
                info!("{}", e);
                let reason = session
                    .shutdown()
                    .reason()
                    .unwrap_or(ShutdownReason::ClientDisconnected);
                self.shutdown(reason.clone()).await;
                return Ok(reason);
            }
            Err(e) => {
                error!("Failed to start server, exiting: {}", e);
                session.metrics().record_error(e.kind(), Some(e.to_string()));
                self.shutdown(ShutdownReason::StartupFailed {
                    message: e.to_string(),
                })
                .await;
                return Err(e);
            }
        }

        let (writer, writer_task) = ClientWriter::spawn(output);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "inbound",
                tokio::spawn(relay::inbound_pump(Arc::clone(session), input).in_current_span()),
            ),
            (
                "outbound",
                tokio::spawn(
                    relay::outbound_pump(Arc::clone(session), writer.clone()).in_current_span(),
                ),
            ),
            (
                "stderr",
                tokio::spawn(relay::error_pump(Arc::clone(session)).in_current_span()),
            ),
        ];

        let supervisor = Arc::clone(&self.supervisor);
        let health_writer = writer.clone();
        tasks.push((
            "health",
            tokio::spawn(
                async move { supervisor.health_check_loop(health_writer).await }.in_current_span(),
            ),
        ));

        let signal_task = self.options.handle_signals.then(|| {
            tokio::spawn(shutdown::listen_for_signals(session.shutdown().clone()).in_current_span())
        });

        info!("Bridge active, relaying between client and server");
        session.shutdown().cancelled().await;
        let reason = session
            .shutdown()
            .reason()
            .unwrap_or(ShutdownReason::ClientDisconnected);

        self.shutdown(reason.clone()).await;

        for (name, task) in tasks {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} task failed: {}", name, e),
                Err(_) => warn!("{} task did not finish in time", name),
            }
        }
        if let Some(task) = signal_task {
            task.abort();
        }

        // Every sender is gone once the pumps and health loop have ended;
        // the writer task then drains what is queued and stops
        drop(writer);
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, writer_task).await.is_err() {
            warn!("Client writer did not drain in time");
        }

        info!("Bridge shutdown complete ({})", reason);
        Ok(reason)
    }

    /// Tear the session down: set the shutdown flag, log final statistics,
    /// stop the server and flush the log file.
    ///
    /// Returns `false` if it had already run. `reason` is only recorded if
    /// no earlier trigger set one.
    pub async fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return false;
        }

        info!("Shutting down workspace isolation bridge...");
        self.session.shutdown().trigger(reason);

        let snapshot = self.session.metrics().snapshot();
        info!(
            "Final stats: uptime={}s, messages_in={}, messages_out={}, restarts={}, unanswered_requests={}",
            self.session.uptime().as_secs(),
            snapshot.messages_in,
            snapshot.messages_out,
            self.session.restart_state().restart_count,
            self.session.requests().pending_count()
        );
        for line in snapshot.to_string().lines() {
            info!("{}", line);
        }

        if let Some(path) = &self.options.metrics_file {
            match self.session.metrics().export_to_file(path) {
                Ok(()) => info!("Metrics exported to {}", path.display()),
                Err(e) => warn!("Failed to export metrics to {}: {}", path.display(), e),
            }
        }

        self.supervisor.terminate().await;

        let log_handle = self
            .log_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = log_handle {
            if let Err(e) = handle.release() {
                warn!("Failed to flush log file: {}", e);
            }
        }

        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::config::{BridgePolicy, ServerDescriptor};
    use crate::test_utils::fixtures::{self, shell};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    fn controller(descriptor: ServerDescriptor, options: ControllerOptions) -> BridgeController {
        BridgeController::new(fixtures::session(descriptor, BridgePolicy::default()), options)
    }

    #[tokio::test]
    async fn test_round_trip_then_client_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_file = dir.path().join("metrics.json");
        let controller = Arc::new(controller(
            ServerDescriptor::new("cat"),
            ControllerOptions {
                handle_signals: false,
                metrics_file: Some(metrics_file.clone()),
            },
        ));

        let (mut client_in, bridge_in) = tokio::io::duplex(4096);
        let (client_out, bridge_out) = tokio::io::duplex(4096);
        let running = Arc::clone(&controller);
        let run = tokio::spawn(async move {
            running.run(BufReader::new(bridge_in), bridge_out).await
        });

        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"req-1\",\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(client_out).lines();
        let line = fixtures::next_line(&mut lines).await;
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","id":"req-1","method":"tools/list"}"#
        );

        drop(client_in);
        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::ClientDisconnected);
        assert_eq!(reason.exit_code(), 0);
        assert!(controller.session().current().is_none());

        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&metrics_file).unwrap()).unwrap();
        assert_eq!(exported["messages_in"], 1);
        assert_eq!(exported["messages_out"], 1);
    }

    #[tokio::test]
    async fn test_killed_server_is_replaced_and_traffic_resumes() {
        let controller = Arc::new(controller(
            ServerDescriptor::new("cat"),
            ControllerOptions::default(),
        ));
        let (mut client_in, bridge_in) = tokio::io::duplex(4096);
        let (client_out, bridge_out) = tokio::io::duplex(4096);
        let running = Arc::clone(&controller);
        let run = tokio::spawn(async move {
            running.run(BufReader::new(bridge_in), bridge_out).await
        });
        let mut lines = BufReader::new(client_out).lines();

        let first = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        client_in.write_all(format!("{first}\n").as_bytes()).await.unwrap();
        assert_eq!(fixtures::next_line(&mut lines).await, first);

        let original = controller.session().current().unwrap();
        unsafe {
            libc::kill(original.pid() as libc::pid_t, libc::SIGKILL);
        }

        let line = fixtures::next_line(&mut lines).await;
        let notification: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(notification["method"], "$/bridge/restarted");
        assert_eq!(notification["params"]["restartCount"], 1);
        assert_eq!(notification["params"]["reason"], "Terminated by signal");

        let replacement = controller.session().current().unwrap();
        assert_ne!(replacement.pid(), original.pid());

        let second = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"find_symbol"}}"#;
        client_in.write_all(format!("{second}\n").as_bytes()).await.unwrap();
        assert_eq!(fixtures::next_line(&mut lines).await, second);

        drop(client_in);
        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::ClientDisconnected);
        assert_eq!(controller.session().restart_state().restart_count, 1);
        assert_eq!(controller.session().metrics().snapshot().restarts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_ends_cleanly() {
        let controller = controller(ServerDescriptor::new("cat"), ControllerOptions::default());
        controller
            .session()
            .shutdown()
            .trigger(ShutdownReason::Signal("SIGINT"));
        let (_client_in, bridge_in) = tokio::io::duplex(64);
        let (_client_out, bridge_out) = tokio::io::duplex(64);

        let reason = controller
            .run(BufReader::new(bridge_in), bridge_out)
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Signal("SIGINT"));
        assert_eq!(reason.exit_code(), 0);
        assert!(controller.session().current().is_none());
    }

    #[tokio::test]
    async fn test_startup_failure_is_fatal() {
        let controller = controller(
            shell("echo boom >&2; exit 1"),
            ControllerOptions::default(),
        );
        let (_client_in, bridge_in) = tokio::io::duplex(64);
        let (_client_out, bridge_out) = tokio::io::duplex(64);

        let err = controller
            .run(BufReader::new(bridge_in), bridge_out)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Startup { exit_code: Some(1), .. }));
        let reason = controller.session().shutdown().reason().unwrap();
        assert!(matches!(reason, ShutdownReason::StartupFailed { .. }));
        assert_eq!(reason.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let controller = controller(ServerDescriptor::new("cat"), ControllerOptions::default());
        let handle = controller.supervisor.start().await.unwrap();
        controller
            .session()
            .shutdown()
            .trigger(ShutdownReason::Signal("SIGINT"));

        assert!(controller.shutdown(ShutdownReason::ClientDisconnected).await);
        assert!(!controller.shutdown(ShutdownReason::ClientDisconnected).await);
        assert_eq!(handle.state(), crate::io::ProcessState::Terminated);
        assert_eq!(
            controller.session().shutdown().reason(),
            Some(ShutdownReason::Signal("SIGINT"))
        );
    }

    #[tokio::test]
    async fn test_external_shutdown_ends_run() {
        let controller = Arc::new(controller(
            ServerDescriptor::new("cat"),
            ControllerOptions::default(),
        ));
        let (_client_in, bridge_in) = tokio::io::duplex(64);
        let (_client_out, bridge_out) = tokio::io::duplex(64);

        let running = Arc::clone(&controller);
        let run = tokio::spawn(async move {
            running.run(BufReader::new(bridge_in), bridge_out).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller
            .session()
            .shutdown()
            .trigger(ShutdownReason::Signal("SIGTERM"));

        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Signal("SIGTERM"));
    }
}
