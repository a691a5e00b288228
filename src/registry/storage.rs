use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;

use crate::connection::ConnectionDescriptor;
use crate::error::{DockerError, Result};

/// Where the registry keeps its connection list between runs.
#[async_trait]
pub trait ConnectionStorage: Send + Sync {
    async fn load(&self) -> Result<Vec<ConnectionDescriptor>>;
    async fn save(&self, connections: &[ConnectionDescriptor]) -> Result<()>;
}

/// Connection list as a pretty printed JSON array.
pub struct JsonConnectionStorage {
    path: PathBuf,
}

impl JsonConnectionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ConnectionStorage for JsonConnectionStorage {
    async fn load(&self) -> Result<Vec<ConnectionDescriptor>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No connections saved at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|e| DockerError::Storage(format!("{}: {}", self.path.display(), e)))
    }

    async fn save(&self, connections: &[ConnectionDescriptor]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let raw = serde_json::to_string_pretty(connections)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}
