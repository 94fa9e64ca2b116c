//! Stdio relay pumps
//!
//! Three independent loops move frames across the bridge. Each one loads the
//! current process handle on every iteration, so after a restart it simply
//! continues against the new process.

use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tracing::{Level, debug, info, trace, warn};

use crate::bridge::error::{BridgeError, StreamDirection};
use crate::bridge::session::BridgeSession;
use crate::bridge::shutdown::ShutdownReason;
use crate::io::transport::read_line_frame;
use crate::io::{ClientWriter, ProcessError, ReadOutcome};
use crate::log_bridge_message;
use crate::metrics::MessageDirection;
use crate::translate::Direction;

/// Client input → current process input.
///
/// End of client input ends the session. A frame that cannot be delivered
/// (no live process, broken pipe) is dropped and the pump carries on, so
/// traffic resumes once a restarted process is current.
pub async fn inbound_pump<R>(session: Arc<BridgeSession>, mut input: R)
where
    R: AsyncBufRead + Unpin,
{
    let shutdown = session.shutdown();
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_line_frame(&mut input, &mut buf) => read,
        };

        match read {
            Ok(ReadOutcome::Line(_)) => {}
            Ok(ReadOutcome::Eof) => {
                info!("Client closed input");
                shutdown.trigger(ShutdownReason::ClientDisconnected);
                break;
            }
            Err(e) => {
                let err = BridgeError::stream(StreamDirection::Inbound, e);
                warn!("{}", err);
                session.metrics().record_error(err.kind(), Some(err.to_string()));
                shutdown.trigger(ShutdownReason::ClientDisconnected);
                break;
            }
        }

        session.metrics().record_message(MessageDirection::Inbound);
        if session.policy().debug {
            log_bridge_message!(Level::DEBUG, StreamDirection::Inbound, &buf);
        }

        let frame = session.translator().translate_line(&buf, Direction::ToForeign);

        let Some(handle) = session.current() else {
            warn!("No server process available, dropping message");
            session
                .metrics()
                .record_error("message_dropped", Some("no server process".to_string()));
            continue;
        };

        session.requests().observe_inbound(&frame);
        if let Err(e) = handle.write_frame(&frame).await {
            warn!(
                "Dropping message, server {} input unavailable: {}",
                handle.pid(),
                e
            );
            session
                .metrics()
                .record_error("message_dropped", Some(e.to_string()));
        }
    }

    debug!("Inbound pump finished");
}

/// Current process output → client output.
///
/// Process EOF or read errors are expected around restarts; the pump idles
/// until a live handle appears. Only a closed client output ends it.
pub async fn outbound_pump(session: Arc<BridgeSession>, writer: ClientWriter) {
    let shutdown = session.shutdown();
    let idle_poll = session.timings().idle_poll;
    let mut buf = Vec::new();

    loop {
        let Some(handle) = session.current() else {
            if idle(&session, idle_poll).await {
                break;
            }
            continue;
        };

        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = handle.read_stdout_frame(&mut buf) => read,
        };

        match read {
            Ok(ReadOutcome::Line(_)) => {}
            Ok(ReadOutcome::Eof) => {
                trace!("Server {} stdout at EOF, waiting for restart", handle.pid());
                if idle(&session, idle_poll).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                record_read_error(&session, StreamDirection::Outbound, handle.pid(), e);
                if idle(&session, idle_poll).await {
                    break;
                }
                continue;
            }
        }

        session.metrics().record_message(MessageDirection::Outbound);
        if session.policy().debug {
            log_bridge_message!(Level::DEBUG, StreamDirection::Outbound, &buf);
        }

        let frame = session.translator().translate_line(&buf, Direction::ToNative);
        session.requests().observe_outbound(&frame, session.metrics());

        if writer.send(frame.into_owned()).is_err() {
            info!("Client output closed");
            shutdown.trigger(ShutdownReason::ClientDisconnected);
            break;
        }
    }

    debug!("Outbound pump finished");
}

/// Current process stderr → bridge diagnostic log. Never reaches the client.
pub async fn error_pump(session: Arc<BridgeSession>) {
    let shutdown = session.shutdown();
    let idle_poll = session.timings().idle_poll;
    let mut buf = Vec::new();

    loop {
        let Some(handle) = session.current() else {
            if idle(&session, idle_poll).await {
                break;
            }
            continue;
        };

        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = handle.read_stderr_frame(&mut buf) => read,
        };

        match read {
            Ok(ReadOutcome::Line(_)) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!("Server stderr: {}", line);
                }
            }
            Ok(ReadOutcome::Eof) => {
                if idle(&session, idle_poll).await {
                    break;
                }
            }
            Err(e) => {
                record_read_error(&session, StreamDirection::Diagnostic, handle.pid(), e);
                if idle(&session, idle_poll).await {
                    break;
                }
            }
        }
    }

    debug!("Error pump finished");
}

/// Sleep one poll interval; returns `true` if shutdown arrived meanwhile
async fn idle(session: &BridgeSession, poll: std::time::Duration) -> bool {
    tokio::select! {
        _ = session.shutdown().cancelled() => true,
        _ = tokio::time::sleep(poll) => false,
    }
}

fn record_read_error(session: &BridgeSession, direction: StreamDirection, pid: u32, e: ProcessError) {
    let err = match e {
        ProcessError::Io(source) => BridgeError::stream(direction, source),
        other => BridgeError::Process(other),
    };
    debug!("Read from server {} failed: {}", pid, err);
    session.metrics().record_error(err.kind(), Some(err.to_string()));
}

// ============================================================================
// Tests
// ============================================================================
