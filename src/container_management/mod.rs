mod cache;
pub mod client;
mod docker;

use bollard::models::{ContainerConfig, ContainerInspectResponse};
use chrono::{DateTime, Utc};

pub use cache::{containers_from_summaries, extract_tags_by_repo, images_from_summaries, ContainerListing};
pub use client::{
    AttachStreams, ClientFactory, CommitOptions, DockerApi, LogChunks, LogOptions, ProgressMessage,
    ProgressStream,
};
pub use docker::{BollardClient, BollardClientFactory};

/// Status text the daemon reports while a container is being deleted.
pub const REMOVAL_IN_PROGRESS: &str = "Removal In Progress";
/// Prefix of the status text of a stopped container, e.g. `Exited (0) 2 minutes ago`.
pub const EXITED_PREFIX: &str = "Exited";
/// Placeholder the daemon uses for untagged images.
pub const NONE_TAG: &str = "<none>";

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    pub names: Vec<String>,
    /// First name without the leading slash.
    pub name: String,
    pub image: String,
    pub command: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Human readable status, e.g. `Up 3 minutes`.
    pub status: String,
    pub state: ContainerStatus,
    pub swarm_service: Option<String>,
    pub swarm_stack: Option<String>,
    pub compose_service: Option<String>,
    pub compose_project: Option<String>,
}

impl Container {
    pub fn is_exited(&self) -> bool {
        self.status.starts_with(EXITED_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl From<String> for ContainerStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "stopped" => ContainerStatus::Stopped,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Running,
        }
    }
}

/// One cache entry per (repo, tag) of a raw image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub parent_id: String,
    pub repo: String,
    pub tag: String,
    /// Every tag the raw image carries for `repo`.
    pub tags: Vec<String>,
    /// The raw `repo:tag` list, shared by all entries of the same image.
    pub repo_tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub size: i64,
    pub virtual_size: i64,
    pub intermediate: bool,
    pub dangling: bool,
}

impl Image {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    raw: ContainerInspectResponse,
}

impl ContainerInfo {
    pub fn new(raw: ContainerInspectResponse) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> Option<&str> {
        self.raw.id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.raw.name.as_deref().map(|n| n.trim_start_matches('/'))
    }

    pub fn config(&self) -> Option<&ContainerConfig> {
        self.raw.config.as_ref()
    }

    pub fn tty(&self) -> bool {
        self.config().and_then(|c| c.tty).unwrap_or(false)
    }

    pub fn running(&self) -> bool {
        self.raw
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false)
    }

    pub fn raw(&self) -> &ContainerInspectResponse {
        &self.raw
    }

    pub fn into_raw(self) -> ContainerInspectResponse {
        self.raw
    }
}

/// Daemon information and version merged together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub containers: i64,
    pub images: i64,
    pub driver: Option<String>,
    pub kernel_version: Option<String>,
    pub operating_system: Option<String>,
    pub cpus: i64,
    pub total_memory: i64,
    pub server_version: Option<String>,
    pub api_version: Option<String>,
    pub go_version: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSearchResult {
    pub name: String,
    pub description: String,
    pub official: bool,
    pub automated: bool,
    pub stars: i64,
}
