//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and shared bridge
//! fixtures.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG` and writes through the test writer so output is
    /// captured per test.
    ///
    /// ```bash
    /// RUST_LOG=mcp_isolation_bridge::bridge=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Auto-initialize test logging for every test in the calling module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Sessions wired with short timings so supervision tests run quickly
#[cfg(test)]
pub mod fixtures {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    use crate::bridge::config::{BridgeConfig, BridgePolicy, ConfigSource, ServerDescriptor};
    use crate::bridge::session::{BridgeSession, BridgeTimings};
    use crate::io::ClientWriter;
    use crate::metrics::BridgeMetrics;

    pub const WORKSPACE_ID: &str = "bridge_test";

    pub fn fast_timings() -> BridgeTimings {
        BridgeTimings {
            startup_grace: Duration::from_millis(50),
            health_period: Duration::from_millis(25),
            idle_poll: Duration::from_millis(10),
            terminate_timeout: Duration::from_secs(2),
            stderr_capture_timeout: Duration::from_millis(500),
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: &str) -> ServerDescriptor {
        ServerDescriptor::new("sh").arg("-c").arg(script)
    }

    pub fn config(descriptor: ServerDescriptor, policy: BridgePolicy) -> BridgeConfig {
        BridgeConfig {
            server_name: "test".to_string(),
            descriptor,
            policy,
            source: ConfigSource::File("test.json".into()),
        }
    }

    pub fn session(descriptor: ServerDescriptor, policy: BridgePolicy) -> Arc<BridgeSession> {
        Arc::new(BridgeSession::new(
            WORKSPACE_ID,
            &config(descriptor, policy),
            fast_timings(),
            Arc::new(BridgeMetrics::default()),
        ))
    }

    /// Client writer whose output is read back line by line
    pub fn client() -> (ClientWriter, Lines<BufReader<DuplexStream>>) {
        let (client_side, bridge_side) = tokio::io::duplex(64 * 1024);
        let (writer, _task) = ClientWriter::spawn(bridge_side);
        (writer, BufReader::new(client_side).lines())
    }

    /// Next client line, failing the test after two seconds
    pub async fn next_line(lines: &mut Lines<BufReader<DuplexStream>>) -> String {
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("timed out waiting for client line")
            .expect("client stream failed")
            .expect("client stream closed")
    }
}
