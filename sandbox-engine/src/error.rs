//! Error taxonomy for the sandbox engine.
//!
//! Every fatal error carries a stable [`ErrorKind`] so callers can decide
//! whether to retry, reconfigure or abandon a run.

use serde::Serialize;
use thiserror::Error;

/// Stable classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid configuration field or encoding, rejected before any container exists
    Configuration,
    /// Container runtime unreachable or hardened image missing
    Environment,
    /// Sample could not be staged into the container
    Staging,
    /// Failure while the sample was running
    Execution,
    /// Input could not be parsed as a whole
    Parsing,
    /// Input exceeded a fixed ceiling
    Resource,
    /// Requested file does not exist
    NotFound,
    /// Requested file lies outside the directories the engine serves
    AccessDenied,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Environment => "environment",
            ErrorKind::Staging => "staging",
            ErrorKind::Execution => "execution",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Resource => "resource",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
        }
    }
}

/// Errors raised while turning a `SandboxConfig` into isolation parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Memory limit must be positive, got {0} bytes")]
    NonPositiveMemoryLimit(u64),
    #[error("Anti-evasion tier {0} is not one of none, 1, 2")]
    InvalidAntiEvasionTier(u8),
}

/// Errors surfaced by `SandboxOrchestrator::execute_sample`
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox config field '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Sample unavailable: {0}")]
    SampleUnavailable(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Sandbox image not found: {image}")]
    ImageNotFound { image: String },

    #[error("Container creation failed: {0}")]
    ContainerCreation(String),

    #[error("Sample upload failed: {0}")]
    UploadFailed(String),

    #[error("Sample execution exceeded {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("Sample execution failed: {0}")]
    Execution(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::InvalidConfig { .. } | SandboxError::Policy(_) => ErrorKind::Configuration,
            SandboxError::SampleUnavailable(_) => ErrorKind::Configuration,
            SandboxError::RuntimeUnavailable(_) | SandboxError::ImageNotFound { .. } => {
                ErrorKind::Environment
            }
            SandboxError::ContainerCreation(_) => ErrorKind::Environment,
            SandboxError::UploadFailed(_) => ErrorKind::Staging,
            SandboxError::ExecutionTimeout { .. } | SandboxError::Execution(_) => {
                ErrorKind::Execution
            }
        }
    }

    /// Whether re-invoking the whole run unchanged may succeed.
    /// Environment and configuration failures need operator action first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::UploadFailed(_)
                | SandboxError::ContainerCreation(_)
                | SandboxError::Execution(_)
        )
    }
}

/// Fatal errors from `MemoryRegionParser`
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Input too large: {size} bytes (max: {max})")]
    InputTooLarge { size: u64, max: u64 },
    #[error("Failed to read memory map: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from `StringExtractor`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Invalid encoding '{0}': expected ascii, unicode or both")]
    InvalidEncoding(String),
}

/// Errors from running Volatility 3 plugins
#[derive(Error, Debug)]
pub enum VolatilityError {
    #[error("Volatility 3 is not installed or not runnable as '{binary}'")]
    NotInstalled { binary: String },
    #[error("Unknown Volatility plugin '{0}'")]
    UnknownPlugin(String),
    #[error("Volatility plugin {plugin} timed out after {timeout_secs}s")]
    Timeout { plugin: String, timeout_secs: u64 },
    #[error("Volatility plugin {plugin} failed: {stderr}")]
    PluginFailed { plugin: String, stderr: String },
    #[error("Volatility plugin {plugin} produced unreadable output: {reason}")]
    InvalidOutput { plugin: String, reason: String },
    #[error("Failed to run Volatility: {0}")]
    Io(#[from] std::io::Error),
}

impl VolatilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VolatilityError::NotInstalled { .. } => ErrorKind::Environment,
            VolatilityError::UnknownPlugin(_) => ErrorKind::Configuration,
            VolatilityError::InvalidOutput { .. } => ErrorKind::Parsing,
            VolatilityError::Timeout { .. }
            | VolatilityError::PluginFailed { .. }
            | VolatilityError::Io(_) => ErrorKind::Execution,
        }
    }
}

/// Errors returned by the command surface
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },
    #[error("Path is outside the dumps directory: {path}")]
    PathOutsideRoot { path: String },
    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("Parse failure: {0}")]
    Parse(ParseError),
    #[error(transparent)]
    Volatility(#[from] VolatilityError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ParseError> for CommandError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InputTooLarge { size, max } => CommandError::FileTooLarge { size, max },
            other => CommandError::Parse(other),
        }
    }
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::FileNotFound { .. } => ErrorKind::NotFound,
            CommandError::PathOutsideRoot { .. } => ErrorKind::AccessDenied,
            CommandError::Volatility(e) => e.kind(),
            CommandError::FileTooLarge { .. } => ErrorKind::Resource,
            CommandError::Extract(_) => ErrorKind::Configuration,
            CommandError::Parse(_) | CommandError::Io(_) => ErrorKind::Parsing,
        }
    }
}
