//! The workspace isolation bridge
//!
//! One bridge instance supervises exactly one downstream server process and
//! relays newline-delimited JSON-RPC between it and the client on the
//! bridge's own stdio.
//!
//! - **config**: server selection and restart policy
//! - **session**: shared state of a running bridge
//! - **supervisor**: start, health checks, restarts, termination
//! - **relay**: the inbound, outbound and stderr pumps
//! - **controller**: startup sequence and the once-only shutdown routine

pub mod config;
pub mod controller;
pub mod error;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod supervisor;

pub use config::BridgeConfig;
pub use controller::{BridgeController, ControllerOptions};
pub use session::{BridgeSession, BridgeTimings};
