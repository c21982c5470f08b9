//! Per-test lifecycle adapters around [`InfluxServer`].

use crate::server::InfluxServer;
use embedded_influx_core::{InfluxError, ServerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A fresh server for every test: started in `before_each`, closed in `after_each`.
#[derive(Debug)]
pub struct ServerInstance {
    config: ServerConfig,
    server: Option<Arc<InfluxServer>>,
}

impl ServerInstance {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            server: None,
        }
    }

    pub async fn before_each(&mut self) -> Result<Arc<InfluxServer>, InfluxError> {
        // A server left over from a test that skipped after_each
        self.after_each().await?;

        let server = Arc::new(InfluxServer::new(self.config.clone()));
        server.start().await?;
        self.server = Some(server.clone());
        Ok(server)
    }

    pub async fn after_each(&mut self) -> Result<(), InfluxError> {
        match self.server.take() {
            Some(server) => server.close().await,
            None => Ok(()),
        }
    }

    pub fn server(&self) -> Option<&Arc<InfluxServer>> {
        self.server.as_ref()
    }

    pub fn url(&self) -> Option<String> {
        self.server.as_ref().map(|s| s.url())
    }
}

impl Default for ServerInstance {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// One long-lived server per named scope, shared by every test in that scope.
///
/// The same scope always maps to the same server; `after_each` stops it but
/// keeps it registered so the next `before_each` restarts it.
#[derive(Debug)]
pub struct ServerRegistry {
    config: ServerConfig,
    servers: Mutex<HashMap<String, Arc<InfluxServer>>>,
}

impl ServerRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Arc<InfluxServer>>> {
        self.servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The server for `scope`, created (not started) on first use
    pub fn server(&self, scope: &str) -> Arc<InfluxServer> {
        self.servers()
            .entry(scope.to_string())
            .or_insert_with(|| {
                debug!(scope = scope, "Registering InfluxServer");
                Arc::new(InfluxServer::new(self.config.clone()))
            })
            .clone()
    }

    pub async fn before_each(&self, scope: &str) -> Result<Arc<InfluxServer>, InfluxError> {
        let server = self.server(scope);
        server.start().await?;
        Ok(server)
    }

    pub async fn after_each(&self, scope: &str) -> Result<(), InfluxError> {
        let server = self.servers().get(scope).cloned();
        match server {
            Some(server) => server.close().await,
            None => Ok(()),
        }
    }

    /// Stop the scope's server and forget it
    pub async fn remove(&self, scope: &str) -> Result<(), InfluxError> {
        let server = self.servers().remove(scope);
        match server {
            Some(server) => server.close().await,
            None => Ok(()),
        }
    }

    /// Stop and forget every registered server, reporting the first failure
    pub async fn close_all(&self) -> Result<(), InfluxError> {
        let servers: Vec<_> = self.servers().drain().collect();
        let mut first_error = None;
        for (scope, server) in servers {
            if let Err(e) = server.close().await {
                debug!(scope = %scope, error = %e, "Failed to close InfluxServer");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<_> = self.servers().keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
