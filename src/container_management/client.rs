use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{Config, LogOutput};
use bollard::models::{
    BuildInfo, ContainerConfig, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    ImageInspect, ImageSummary, PushImageInfo,
};
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use super::{ConnectionInfo, ImageSearchResult};
use crate::connection::Transport;
use crate::error::Result;

pub type LogChunks = BoxStream<'static, Result<LogOutput>>;
pub type ProgressStream = BoxStream<'static, Result<ProgressMessage>>;

/// The two directions of a hijacked attach connection.
pub struct AttachStreams {
    pub output: LogChunks,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub timestamps: bool,
    /// Unix timestamp; `0` means from the beginning.
    pub since: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    pub container: String,
    pub repo: String,
    pub tag: Option<String>,
    pub comment: Option<String>,
    pub author: Option<String>,
}

/// A progress line of a build, pull or push operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressMessage {
    pub id: Option<String>,
    pub status: Option<String>,
    /// Build output; build messages carry their text here rather than in `status`.
    pub stream: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    /// Image id announced by the daemon at the end of a build.
    pub image_id: Option<String>,
}

impl ProgressMessage {
    /// The human readable text of the message, whichever field carries it.
    pub fn text(&self) -> Option<&str> {
        self.stream.as_deref().or(self.status.as_deref())
    }
}

impl From<BuildInfo> for ProgressMessage {
    fn from(info: BuildInfo) -> Self {
        let error = info
            .error
            .or_else(|| info.error_detail.and_then(|detail| detail.message));
        Self {
            id: info.id,
            status: info.status,
            stream: info.stream,
            progress: info.progress,
            error,
            image_id: info.aux.and_then(|aux| aux.id),
        }
    }
}

impl From<CreateImageInfo> for ProgressMessage {
    fn from(info: CreateImageInfo) -> Self {
        Self {
            id: info.id,
            status: info.status,
            progress: info.progress,
            error: info.error,
            ..Default::default()
        }
    }
}

impl From<PushImageInfo> for ProgressMessage {
    fn from(info: PushImageInfo) -> Self {
        Self {
            status: info.status,
            progress: info.progress,
            error: info.error,
            ..Default::default()
        }
    }
}

/// Everything the connection layer needs from a Docker Engine API client.
///
/// Listing and inspection hand back the engine's own models; translation to
/// the cache types happens in the connection layer.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn info(&self) -> Result<ConnectionInfo>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse>;
    async fn create_container(&self, config: Config<String>, name: Option<&str>) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()>;
    async fn kill_container(&self, id: &str) -> Result<()>;
    async fn pause_container(&self, id: &str) -> Result<()>;
    async fn unpause_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn commit_container(&self, options: CommitOptions, config: ContainerConfig) -> Result<String>;
    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;
    fn logs(&self, id: &str, options: LogOptions) -> LogChunks;
    async fn attach_container(&self, id: &str) -> Result<AttachStreams>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;
    async fn inspect_image(&self, id: &str) -> Result<ImageInspect>;
    async fn search_images(&self, term: &str) -> Result<Vec<ImageSearchResult>>;
    fn pull_image(&self, image: &str) -> ProgressStream;
    fn push_image(&self, image: &str) -> ProgressStream;
    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()>;
    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;
    /// `context` is a tar archive of the build directory.
    fn build_image(&self, context: Vec<u8>, name: Option<&str>) -> ProgressStream;
}

/// Opens client handles for a transport.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn DockerApi>>;
}
