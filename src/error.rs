use thiserror::Error;

pub type Result<T> = std::result::Result<T, DockerError>;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to open connection '{name}': {message}")]
    Open { name: String, message: String },

    #[error("connection '{0}' is not open")]
    NotOpen(String),

    /// The connection handler went away while a request was in flight.
    #[error("connection '{0}' was closed")]
    Closed(String),

    #[error("failed to ping the Docker daemon: {0}")]
    Ping(String),

    #[error("failed to retrieve the Docker daemon information: {0}")]
    Info(String),

    #[error("no such container: {0}")]
    ContainerNotFound(String),

    #[error("failed to list containers on '{connection}': {message}")]
    ListContainers { connection: String, message: String },

    #[error("failed to list images on '{connection}': {message}")]
    ListImages { connection: String, message: String },

    #[error("failed to build image '{image}': {message}")]
    BuildFailed { image: String, message: String },

    #[error("failed to transfer image '{image}': {message}")]
    ImageTransfer { image: String, message: String },

    #[error("request to the Docker daemon timed out")]
    Timeout,

    #[error("giving up on '{id}' after {attempts} timed out attempts")]
    RetriesExhausted { id: String, attempts: u32 },

    #[error("a connection named '{0}' already exists")]
    DuplicateConnection(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{message}")]
    Daemon {
        message: String,
        #[source]
        source: Option<bollard::errors::Error>,
    },

    #[error("connection storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DockerError {
    pub fn daemon(message: impl Into<String>) -> Self {
        DockerError::Daemon {
            message: message.into(),
            source: None,
        }
    }

    /// Transient failures that the log and attach pumps retry in place.
    pub fn is_timeout(&self) -> bool {
        match self {
            DockerError::Timeout => true,
            DockerError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub fn is_container_not_found(&self) -> bool {
        matches!(self, DockerError::ContainerNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_recognised() {
        assert!(DockerError::Timeout.is_timeout());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert!(DockerError::Io(io).is_timeout());
        assert!(!DockerError::daemon("boom").is_timeout());
    }

    #[test]
    fn build_failure_carries_image_and_message() {
        let err = DockerError::BuildFailed {
            image: "app:latest".to_string(),
            message: "COPY failed".to_string(),
        };
        assert_eq!(err.to_string(), "failed to build image 'app:latest': COPY failed");
    }
}
