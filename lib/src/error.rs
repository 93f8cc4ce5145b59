//! Failure classification for the agent entrypoints.

use thiserror::Error;

/// Process exit codes from the host agent's extension contract.
///
/// Code 51 ("no usable runtime") is emitted by the launcher shim before this
/// binary ever runs; it is listed so the whole table lives in one place.
pub mod exitcode {
    /// Normal termination. The outcome is read from the status file.
    pub const SUCCESS: i32 = 0;
    /// No usable runtime was found (owned by the launcher shim).
    pub const MISSING_RUNTIME: i32 = 51;
    /// The handler environment or the distribution is unusable.
    pub const ENVIRONMENT: i32 = 52;
    /// The request could not be parsed or validated.
    pub const CONFIGURATION: i32 = 53;
    /// Any other failure before an outcome could be persisted.
    pub const GENERAL: i32 = 1;
}

/// Failures that terminate the process with a contract-defined exit code,
/// as opposed to per-patch errors which are recorded in the status file.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The handler environment descriptor is missing or invalid.
    #[error("environment error: {0}")]
    Environment(String),
    /// No package-manager adapter matches the detected distribution.
    #[error("unsupported distribution: {0}")]
    UnsupportedDistro(String),
    /// The request failed parsing or validation.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AgentError {
    /// The exit code the host agent expects for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Environment(_) | AgentError::UnsupportedDistro(_) => exitcode::ENVIRONMENT,
            AgentError::Configuration(_) => exitcode::CONFIGURATION,
        }
    }
}
