//! Host platform detection.
//!
//! Detection only ever talks to an [`Environment`], so the policy can be
//! exercised against a scripted host in tests.

use crate::error::InfluxError;
use regex::Regex;
use std::fmt;
use std::process::Command;
use std::sync::LazyLock;

static NIX_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("nix|nux|aix").expect("static regex is valid"));

/// Operating system families we ship binaries for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingSystem {
    Windows,
    MacOs,
    Linux,
}

impl OperatingSystem {
    pub const ALL: [OperatingSystem; 3] = [
        OperatingSystem::Windows,
        OperatingSystem::MacOs,
        OperatingSystem::Linux,
    ];

    /// Directory component used for this OS in the resource layout
    pub fn value(&self) -> &'static str {
        match self {
            OperatingSystem::Windows => "win",
            OperatingSystem::MacOs => "mac",
            OperatingSystem::Linux => "linux",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            OperatingSystem::Windows => ".exe",
            _ => "",
        }
    }
}

/// CPU word width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::X86, Architecture::X64];

    pub fn value(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: OperatingSystem,
    pub arch: Architecture,
}

impl Platform {
    pub fn new(os: OperatingSystem, arch: Architecture) -> Self {
        Self { os, arch }
    }

    /// Only 64-bit builds of influxd are bundled.
    pub fn is_supported(&self) -> bool {
        self.arch == Architecture::X64
    }

    /// Relative resource path of the influxd payload, e.g. `linux/x64/influxd`
    pub fn binary_name(&self) -> String {
        [
            self.os.value(),
            self.arch.value(),
            &format!("influxd{}", self.os.file_extension()),
        ]
        .join("/")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.value(), self.arch.value())
    }
}

/// Read-only view of the host used by platform detection
pub trait Environment: Send + Sync {
    /// Named host property; only `os.name` is consulted
    fn property(&self, name: &str) -> Option<String>;

    /// Environment variable lookup
    fn var(&self, name: &str) -> Option<String>;

    /// Run a short diagnostic command and return its standard output
    fn command_output(&self, program: &str, args: &[&str]) -> std::io::Result<String>;
}

/// The real host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn property(&self, name: &str) -> Option<String> {
        match name {
            "os.name" => Some(
                match std::env::consts::OS {
                    "windows" => "Windows",
                    "macos" => "Mac OS X",
                    "linux" => "Linux",
                    other => other,
                }
                .to_string(),
            ),
            _ => None,
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn command_output(&self, program: &str, args: &[&str]) -> std::io::Result<String> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "'{program}' exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub fn detect_platform(env: &dyn Environment) -> Result<Platform, InfluxError> {
    let os = detect_os(env)?;
    let arch = detect_architecture(env, os)?;
    tracing::debug!(os = ?os, arch = ?arch, "Detected host platform");
    Ok(Platform::new(os, arch))
}

fn detect_os(env: &dyn Environment) -> Result<OperatingSystem, InfluxError> {
    let name = env
        .property("os.name")
        .ok_or_else(|| InfluxError::UnsupportedPlatform("os.name is not set".to_string()))?;
    let lower = name.to_lowercase();

    if lower.contains("win") {
        Ok(OperatingSystem::Windows)
    } else if lower == "mac os x" {
        Ok(OperatingSystem::MacOs)
    } else if NIX_NAME.is_match(&lower) {
        Ok(OperatingSystem::Linux)
    } else {
        Err(InfluxError::UnsupportedPlatform(format!("Unsupported OS: {name}")))
    }
}

fn detect_architecture(
    env: &dyn Environment,
    os: OperatingSystem,
) -> Result<Architecture, InfluxError> {
    match os {
        OperatingSystem::Windows => Ok(windows_architecture(env)),
        OperatingSystem::MacOs => architecture_from_command(env, "sysctl", &["hw"], |line| {
            line.contains("cpu64bit_capable") && line.trim_end().ends_with('1')
        }),
        OperatingSystem::Linux => {
            architecture_from_command(env, "uname", &["-m"], |line| line.contains("64"))
        }
    }
}

fn windows_architecture(env: &dyn Environment) -> Architecture {
    let ends_with_64 = |name: &str| env.var(name).is_some_and(|v| v.trim().ends_with("64"));

    // A 32-bit process on a 64-bit host reports the real width through the WOW64 variable
    if ends_with_64("PROCESSOR_ARCHITECTURE") || ends_with_64("PROCESSOR_ARCHITEW6432") {
        Architecture::X64
    } else {
        Architecture::X86
    }
}

fn architecture_from_command(
    env: &dyn Environment,
    program: &str,
    args: &[&str],
    is_64_bit: impl Fn(&str) -> bool,
) -> Result<Architecture, InfluxError> {
    let output = env.command_output(program, args).map_err(|e| {
        InfluxError::UnsupportedPlatform(format!(
            "Failed to detect architecture with command '{program} {}': {e}",
            args.join(" ")
        ))
    })?;

    if output.lines().any(is_64_bit) {
        Ok(Architecture::X64)
    } else {
        Ok(Architecture::X86)
    }
}
