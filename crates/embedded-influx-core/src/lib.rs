//! embedded-influx core - platform-independent building blocks
//!
//! This crate provides the configuration, error taxonomy, process traits,
//! platform detection, binary resolution and temp-resource reaping shared by
//! the platform-specific process managers and the `InfluxServer` supervisor.

mod config;
mod error;
mod process;
mod stdio;

pub mod platform;
pub mod ports;
pub mod provider;
pub mod reaper;
pub mod scratch;

pub use config::*;
pub use error::*;
pub use process::*;
pub use stdio::*;

// Re-export core types
pub use platform::{Architecture, Environment, OperatingSystem, Platform, SystemEnvironment};
pub use provider::{BinaryResolver, DirectoryResources, ExecutableSource, FixedExecutable};
pub use reaper::{ReaperHandle, ShutdownGuard};
pub use scratch::ScratchDir;
