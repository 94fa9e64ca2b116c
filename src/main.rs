mod bridge;
mod io;
mod jsonrpc;
mod logging;
mod metrics;
mod translate;

#[cfg(test)]
mod test_utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{BufReader, stdin, stdout};
use tracing::{error, info, warn};

use bridge::config::ConfigSource;
use bridge::session::generate_workspace_id;
use bridge::{BridgeConfig, BridgeController, BridgeSession, BridgeTimings, ControllerOptions};
use logging::{LogConfig, init_logging};
use metrics::BridgeMetrics;

/// Time left to blocked stdin readers once the bridge has finished
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// CLI arguments for the workspace isolation bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server configuration file (overrides BRIDGE_CONFIG and the search path)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name of the server entry to run (defaults to the first one declared)
    #[arg(long, value_name = "NAME")]
    server: Option<String>,

    /// Enable debug logging and per-message tracing (overrides BRIDGE_DEBUG)
    #[arg(long)]
    debug: bool,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides BRIDGE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Write a JSON metrics snapshot here on shutdown
    #[arg(long, value_name = "FILE", env = "BRIDGE_METRICS_FILE")]
    metrics_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let workspace_id = generate_workspace_id();

    let mut config = match BridgeConfig::load(args.config.as_deref(), args.server.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load bridge configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.debug {
        config.policy.debug = true;
    }

    let log_config = LogConfig::from_env()
        .with_overrides(args.log_level, args.log_file)
        .with_debug(config.policy.debug, &workspace_id);
    let log_handle = match init_logging(log_config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = log_handle.file_path() {
        info!("Logging to {}", path.display());
    }

    match &config.source {
        ConfigSource::File(path) => info!("Loaded configuration from {}", path.display()),
        ConfigSource::Defaults {
            searched,
            interpreter,
        } => warn!(
            "No configuration file found (searched {:?}), using built-in server with {}",
            searched, interpreter
        ),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let session = BridgeSession::new(
        workspace_id,
        &config,
        BridgeTimings::default(),
        Arc::new(BridgeMetrics::default()),
    );
    let controller = BridgeController::new(
        Arc::new(session),
        ControllerOptions {
            handle_signals: true,
            metrics_file: args.metrics_file,
        },
    )
    .with_log_handle(log_handle);

    let result = runtime.block_on(controller.run(BufReader::new(stdin()), stdout()));

    // Tokio's stdin reads on a blocking thread that cannot be interrupted
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    match result {
        Ok(reason) => ExitCode::from(reason.exit_code()),
        Err(e) => {
            error!("Bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
