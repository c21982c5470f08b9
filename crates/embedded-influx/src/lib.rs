//! Disposable InfluxDB instances for integration tests.
//!
//! [`InfluxServer`] runs a platform-matched `influxd` in a throw-away scratch
//! directory, waits until it is ready to accept requests and tears it down
//! again. [`ServerInstance`] and [`ServerRegistry`] adapt it to per-test and
//! per-suite lifecycles.

mod factory;
mod harness;
mod server;

pub use factory::{PlatformProcessHandle, PlatformProcessManager, PlatformProcessManagerFactory};
pub use harness::{ServerInstance, ServerRegistry};
pub use server::InfluxServer;

// Re-export core functionality
pub use embedded_influx_core::*;
