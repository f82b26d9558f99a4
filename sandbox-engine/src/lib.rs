//! Malware execution sandbox for the Nexus-Security platform.
//!
//! Runs untrusted samples in hardened containers, monitors syscalls, network
//! traffic and memory while they execute, and returns a MITRE ATT&CK mapped
//! [`ExecutionReport`](sandbox::ExecutionReport).

pub mod commands;
pub mod config;
pub mod error;
pub mod memory;
pub mod observability;
pub mod sandbox;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::{
    analyze_memory_with_volatility, check_volatility_available, extract_strings_from_dump,
    get_memory_regions,
};
pub use config::EngineConfig;
pub use error::{CommandError, ErrorKind, SandboxError, VolatilityError};
pub use sandbox::{ExecutionReport, SandboxConfig, SandboxOrchestrator, SampleSource};
