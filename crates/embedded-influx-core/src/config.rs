use crate::error::InfluxError;
use crate::platform::Environment;
use crate::provider::{BinaryResolver, ExecutableSource, FixedExecutable};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Stderr line influxd prints once its listeners are bound
pub const DEFAULT_READINESS_MARKER: &str = "Listening for signals";

pub const DEFAULT_TIMEOUT_MILLIS: u64 = 2000;

pub const PORT_ENV: &str = "EMBEDDED_INFLUX_PORT";
pub const TIMEOUT_ENV: &str = "EMBEDDED_INFLUX_TIMEOUT_MS";
pub const BINARY_ENV: &str = "EMBEDDED_INFLUX_BINARY";
pub const ECHO_ENV: &str = "EMBEDDED_INFLUX_ECHO";

/// Immutable configuration of one supervised influxd
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate", error = "InfluxError"))]
pub struct ServerConfig {
    /// HTTP port; 0 picks a free one on first start
    #[builder(default)]
    pub port: u16,

    /// How long `start()` waits for the readiness marker
    #[builder(default = "default_timeout()")]
    pub timeout: Duration,

    #[builder(default = "default_executable_source()", setter(custom))]
    pub executable_source: Arc<dyn ExecutableSource>,

    #[builder(default = "DEFAULT_READINESS_MARKER.to_string()")]
    pub readiness_marker: String,

    /// Copy the server's stderr to our own stderr
    #[builder(default = "true")]
    pub echo_output: bool,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            timeout: default_timeout(),
            executable_source: default_executable_source(),
            readiness_marker: DEFAULT_READINESS_MARKER.to_string(),
            echo_output: true,
        }
    }
}

impl ServerConfigBuilder {
    pub fn executable_source<S: ExecutableSource + 'static>(&mut self, source: S) -> &mut Self {
        self.executable_source = Some(Arc::new(source));
        self
    }

    pub fn shared_executable_source(&mut self, source: Arc<dyn ExecutableSource>) -> &mut Self {
        self.executable_source = Some(source);
        self
    }

    /// Use an influxd that is already installed instead of a bundled payload
    pub fn executable(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.executable_source(FixedExecutable(path.into()))
    }

    fn validate(&self) -> Result<(), InfluxError> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(InfluxError::configuration_error("timeout must be non-zero"));
        }
        if self.readiness_marker.as_ref().is_some_and(|m| m.is_empty()) {
            return Err(InfluxError::configuration_error(
                "readiness marker must not be empty",
            ));
        }
        Ok(())
    }
}

impl From<derive_builder::UninitializedFieldError> for InfluxError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        InfluxError::configuration_error(e.to_string())
    }
}

/// Serializable subset of [`ServerConfig`], for config files and environment overrides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    #[serde(default)]
    pub port: u16,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pre-installed influxd to run instead of the bundled one
    #[serde(default)]
    pub executable: Option<PathBuf>,

    #[serde(default = "default_echo_output")]
    pub echo_output: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 0,
            timeout_ms: default_timeout_ms(),
            executable: None,
            echo_output: default_echo_output(),
        }
    }
}

impl ServerOptions {
    /// Defaults overridden by `EMBEDDED_INFLUX_*` variables
    pub fn from_env(env: &dyn Environment) -> Result<Self, InfluxError> {
        let mut options = Self::default();

        if let Some(port) = env.var(PORT_ENV) {
            options.port = parse_var(PORT_ENV, &port)?;
        }
        if let Some(timeout) = env.var(TIMEOUT_ENV) {
            options.timeout_ms = parse_var(TIMEOUT_ENV, &timeout)?;
        }
        if let Some(binary) = env.var(BINARY_ENV).filter(|b| !b.is_empty()) {
            options.executable = Some(PathBuf::from(binary));
        }
        if let Some(echo) = env.var(ECHO_ENV) {
            options.echo_output = parse_var(ECHO_ENV, &echo)?;
        }

        Ok(options)
    }

    pub fn into_config(self) -> Result<ServerConfig, InfluxError> {
        let mut builder = ServerConfig::builder();
        builder
            .port(self.port)
            .timeout(Duration::from_millis(self.timeout_ms))
            .echo_output(self.echo_output);
        if let Some(path) = self.executable {
            builder.executable(path);
        }
        builder.build()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, InfluxError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| InfluxError::configuration_error(format!("invalid {name}={value:?}: {e}")))
}

fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MILLIS)
}

fn default_executable_source() -> Arc<dyn ExecutableSource> {
    BinaryResolver::shared()
}

// Default value functions for serde
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MILLIS
}
fn default_echo_output() -> bool {
    true
}
