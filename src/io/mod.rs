pub mod handler;

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::container_management::{Container, DockerApi, Image};
use crate::log_worker::{LogSink, LoggingStatus};

/// Requests served by a connection's handler task, one at a time.
pub enum Command {
    Client(oneshot::Sender<Arc<dyn DockerApi>>),
    Containers {
        force: bool,
        reply: Option<oneshot::Sender<Arc<Vec<Container>>>>,
    },
    Images {
        force: bool,
        reply: Option<oneshot::Sender<Arc<Vec<Image>>>>,
    },
    ContainersLoaded(oneshot::Sender<bool>),
    ImagesLoaded(oneshot::Sender<bool>),
    StartLogging {
        container_id: String,
        logging_id: String,
        follow: bool,
        sink: LogSink,
        reply: oneshot::Sender<bool>,
    },
    StopLogging {
        logging_id: String,
        remove: bool,
    },
    LoggingStatus {
        logging_id: String,
        reply: oneshot::Sender<LoggingStatus>,
    },
    StopAllLogging,
    Close,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Client(_) => write!(f, "Client"),
            Command::Containers { force, .. } => write!(f, "Containers(force={})", force),
            Command::Images { force, .. } => write!(f, "Images(force={})", force),
            Command::ContainersLoaded(_) => write!(f, "ContainersLoaded"),
            Command::ImagesLoaded(_) => write!(f, "ImagesLoaded"),
            Command::StartLogging { logging_id, .. } => write!(f, "StartLogging({})", logging_id),
            Command::StopLogging { logging_id, .. } => write!(f, "StopLogging({})", logging_id),
            Command::LoggingStatus { logging_id, .. } => write!(f, "LoggingStatus({})", logging_id),
            Command::StopAllLogging => write!(f, "StopAllLogging"),
            Command::Close => write!(f, "Close"),
        }
    }
}
