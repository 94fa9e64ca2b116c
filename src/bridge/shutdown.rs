//! Shutdown coordination
//!
//! A single cancellation token observed by every bridge task, plus the
//! reason recorded by whichever party asked first. The flag only ever goes
//! from unset to set.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the bridge is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An interrupt or termination signal arrived
    Signal(&'static str),
    /// The client closed the bridge's input
    ClientDisconnected,
    /// The first server process never came up
    StartupFailed { message: String },
    /// The restart budget was spent
    RestartsExhausted { max_restarts: u32 },
    /// A restart attempt failed to produce a live process
    RestartFailed { message: String },
}

impl ShutdownReason {
    /// Whether this reason indicates the bridge failed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShutdownReason::StartupFailed { .. }
                | ShutdownReason::RestartsExhausted { .. }
                | ShutdownReason::RestartFailed { .. }
        )
    }

    /// Process exit code for this reason
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() { 1 } else { 0 }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {name}"),
            ShutdownReason::ClientDisconnected => write!(f, "client disconnected"),
            ShutdownReason::StartupFailed { message } => write!(f, "startup failed: {message}"),
            ShutdownReason::RestartsExhausted { max_restarts } => {
                write!(f, "maximum restarts ({max_restarts}) exceeded")
            }
            ShutdownReason::RestartFailed { message } => write!(f, "restart failed: {message}"),
        }
    }
}

#[derive(Debug, Default)]
struct ShutdownInner {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

/// Cloneable handle on the session's shutdown flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    ///
    /// Returns `true` for the call that actually set the flag; later calls
    /// keep the first reason and return `false`.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.inner.reason.set(reason.clone()).is_ok();
        if first {
            if reason.is_fatal() {
                warn!("Shutdown requested: {}", reason);
            } else {
                info!("Shutdown requested: {}", reason);
            }
        }
        self.inner.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason recorded by the first trigger
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason.get().cloned()
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }
}

/// Wait for SIGINT or SIGTERM and trigger shutdown
pub async fn listen_for_signals(shutdown: ShutdownSignal) {
    let name = wait_for_signal().await;
    shutdown.trigger(ShutdownReason::Signal(name));
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c_only().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c_only().await
}

async fn ctrl_c_only() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        // Without a handler nothing can arrive; let the other triggers win
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

// ============================================================================
// Tests
// ============================================================================
