use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Core error types for embedded InfluxDB operations
#[derive(Error, Debug)]
pub enum InfluxError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to load expected resource '{0}'")]
    MissingResource(String),

    #[error("Failed to materialize resource at {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} waiting for InfluxDB to start")]
    StartupTimeout(Duration),

    #[error("InfluxDB exited before it was ready (status: {status:?})")]
    ExitedBeforeReady { status: Option<ExitStatus> },

    #[error("Process management error: {0}")]
    ProcessError(String),

    #[error("Failed to stop InfluxDB: {0}")]
    StopFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl InfluxError {
    pub fn process_error(message: impl Into<String>) -> Self {
        InfluxError::ProcessError(message.into())
    }

    pub fn stop_failed(message: impl Into<String>) -> Self {
        InfluxError::StopFailed(message.into())
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        InfluxError::ConfigurationError(message.into())
    }

    /// Check if calling the failed operation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InfluxError::StartupTimeout(_)
                | InfluxError::ExitedBeforeReady { .. }
                | InfluxError::StopFailed(_)
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            InfluxError::UnsupportedPlatform(_)
                | InfluxError::MissingResource(_)
                | InfluxError::Resource { .. }
                | InfluxError::ConfigurationError(_)
        )
    }
}
