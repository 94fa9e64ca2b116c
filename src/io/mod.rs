//! I/O layer - downstream processes and line-framed streams
//!
//! - **Process**: spawning, liveness, per-stream frame I/O and termination
//!   of one downstream server
//! - **Transport**: newline framing and the serialized client writer
//!
//! Nothing here inspects message contents.

pub mod process;
pub mod transport;

pub use process::{ProcessError, ProcessExit, ProcessHandle, ProcessState, TerminationOutcome};
pub use transport::{ClientWriter, ReadOutcome};
