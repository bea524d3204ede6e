//! Runtime glue that wires configuration, telemetry, the mirror protocol and
//! the scheduling runner.

pub mod config;
pub mod protocol;
pub mod runner;
pub mod telemetry;
