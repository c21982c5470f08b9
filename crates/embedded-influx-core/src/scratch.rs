//! Per-start scratch area and the influxd configuration that points into it.

use crate::reaper::{self, ReaperHandle};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "influxd.conf";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct InfluxdConfig {
    reporting_disabled: bool,
    bind_address: String,
    meta: MetaSection,
    data: DataSection,
    http: HttpSection,
}

#[derive(Debug, Serialize)]
struct MetaSection {
    dir: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct DataSection {
    dir: PathBuf,
    wal_dir: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct HttpSection {
    bind_address: String,
}

/// Render the influxd TOML configuration.
///
/// Paths go through the TOML serializer, which escapes backslashes and quotes.
pub fn render_config(root: &Path, internal_port: u16, http_port: u16) -> anyhow::Result<String> {
    let config = InfluxdConfig {
        reporting_disabled: true,
        bind_address: format!("127.0.0.1:{internal_port}"),
        meta: MetaSection {
            dir: root.join("meta"),
        },
        data: DataSection {
            dir: root.join("data"),
            wal_dir: root.join("wal"),
        },
        http: HttpSection {
            bind_address: format!(":{http_port}"),
        },
    };
    Ok(toml::to_string(&config)?)
}

/// A freshly created scratch root with its config file written
#[derive(Debug)]
pub struct ScratchDir {
    handle: ReaperHandle,
    config_file: PathBuf,
}

impl ScratchDir {
    /// Create `meta`, `data` and `wal` under a new temp root, register the
    /// root for teardown, then write the configuration.
    pub fn create(internal_port: u16, http_port: u16) -> anyhow::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("influx")
            .tempdir()?
            .keep();
        let handle = reaper::delete_recursively(&root);

        for sub in ["meta", "data", "wal"] {
            std::fs::create_dir_all(root.join(sub))?;
        }

        let config_file = root.join(CONFIG_FILE_NAME);
        std::fs::write(&config_file, render_config(&root, internal_port, http_port)?)?;

        tracing::debug!(root = %root.display(), "Created scratch directory");
        Ok(Self {
            handle,
            config_file,
        })
    }

    pub fn root(&self) -> &Path {
        self.handle.path()
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Delete the scratch tree now instead of at teardown.
    pub fn reclaim(&self) {
        self.handle.reclaim();
    }
}
