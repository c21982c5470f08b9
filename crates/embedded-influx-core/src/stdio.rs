use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Where echoed server output goes
pub struct ServerOutput(SharedWriter);

impl Clone for ServerOutput {
    fn clone(&self) -> Self {
        ServerOutput(self.0.clone())
    }
}

impl Default for ServerOutput {
    fn default() -> Self {
        Self::stderr()
    }
}

impl std::fmt::Debug for ServerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerOutput")
    }
}

impl ServerOutput {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> ServerOutput {
        ServerOutput(Arc::new(Mutex::new(t)))
    }

    pub fn stderr() -> ServerOutput {
        Self::new(Box::new(tokio::io::stderr()))
    }

    /// Write one line followed by a newline. Write errors are dropped.
    pub async fn println(&self, line: &str) {
        let mut lock = self.0.lock().await;
        let _ = lock.write_all(line.as_bytes()).await;
        let _ = lock.write_all(b"\n").await;
        let _ = lock.flush().await;
    }
}
