//! Locating the influxd executable.

use crate::error::InfluxError;
use crate::platform::{Environment, SystemEnvironment, detect_platform};
use crate::reaper;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

/// Environment variable naming the directory that holds bundled payloads
pub const RESOURCES_ENV: &str = "EMBEDDED_INFLUX_RESOURCES";

/// Pull-based provider of an influxd executable
pub trait ExecutableSource: Send + Sync + fmt::Debug {
    fn executable(&self) -> Result<PathBuf, InfluxError>;
}

/// An executable that already exists on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedExecutable(pub PathBuf);

impl ExecutableSource for FixedExecutable {
    fn executable(&self) -> Result<PathBuf, InfluxError> {
        Ok(self.0.clone())
    }
}

/// Source of packaged payloads addressed by relative name
pub trait ResourceLoader: Send + Sync + fmt::Debug {
    fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Payloads laid out on disk as `<root>/<os>/<arch>/influxd[.exe]`
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$EMBEDDED_INFLUX_RESOURCES`, or the `resources` directory of this crate
    pub fn from_environment(env: &dyn Environment) -> Self {
        let root = env
            .var(RESOURCES_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("resources"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceLoader for DirectoryResources {
    fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(self.root.join(name))?;
        Ok(Box::new(file))
    }
}

static SHARED: LazyLock<Arc<BinaryResolver>> = LazyLock::new(|| {
    let environment: Arc<dyn Environment> = Arc::new(SystemEnvironment);
    let resources = Arc::new(DirectoryResources::from_environment(environment.as_ref()));
    Arc::new(BinaryResolver::new(environment, resources))
});

/// Detects the host, checks a payload is bundled for it, and copies that
/// payload into a private temp directory the first time it is asked.
pub struct BinaryResolver {
    environment: Arc<dyn Environment>,
    resources: Arc<dyn ResourceLoader>,
    cached: OnceLock<PathBuf>,
    init: Mutex<()>,
}

impl fmt::Debug for BinaryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryResolver")
            .field("resources", &self.resources)
            .field("cached", &self.cached.get())
            .finish()
    }
}

impl BinaryResolver {
    pub fn new(environment: Arc<dyn Environment>, resources: Arc<dyn ResourceLoader>) -> Self {
        Self {
            environment,
            resources,
            cached: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// Process-wide resolver backed by the real host
    pub fn shared() -> Arc<BinaryResolver> {
        SHARED.clone()
    }

    fn resolve(&self) -> Result<PathBuf, InfluxError> {
        let platform = detect_platform(self.environment.as_ref())?;
        if !platform.is_supported() {
            return Err(InfluxError::UnsupportedPlatform(format!(
                "No influxd binary for the current platform: {platform}"
            )));
        }
        copy_executable_resource(self.resources.as_ref(), &platform.binary_name())
    }
}

impl ExecutableSource for BinaryResolver {
    fn executable(&self) -> Result<PathBuf, InfluxError> {
        if let Some(path) = self.cached.get() {
            return Ok(path.clone());
        }

        let _guard = self.init.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(path) = self.cached.get() {
            return Ok(path.clone());
        }

        let path = self.resolve()?;
        tracing::info!(path = %path.display(), "Materialized influxd executable");
        Ok(self.cached.get_or_init(|| path).clone())
    }
}

/// Copy the payload named `name` into a fresh temp directory and mark it executable.
pub fn copy_executable_resource(
    resources: &dyn ResourceLoader,
    name: &str,
) -> Result<PathBuf, InfluxError> {
    let mut input = resources
        .open(name)
        .map_err(|_| InfluxError::MissingResource(name.to_string()))?;

    let temp_dir = tempfile::Builder::new()
        .prefix("embedded_influx")
        .tempdir()?
        .keep();
    reaper::delete_recursively(&temp_dir);

    let exe = temp_dir.join(name);
    write_executable(&mut input, &exe).map_err(|source| InfluxError::Resource {
        path: exe.clone(),
        source,
    })?;

    Ok(exe)
}

fn write_executable(input: &mut dyn Read, exe: &Path) -> std::io::Result<()> {
    if let Some(parent) = exe.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut output = std::fs::File::create(exe)?;
    std::io::copy(input, &mut output)?;
    output.sync_all()?;
    set_executable(exe)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
