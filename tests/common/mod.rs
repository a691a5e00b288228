#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bollard::container::{Config, LogOutput};
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerState, ContainerSummary, ImageInspect,
    ImageSummary,
};
use bytes::Bytes;
use futures::channel::mpsc as feed;
use futures::stream::{self, StreamExt};

use dockmate::connection::{Connection, ConnectionDescriptor, Transport};
use dockmate::container_management::{
    AttachStreams, ClientFactory, CommitOptions, ConnectionInfo, DockerApi, ImageSearchResult,
    LogChunks, LogOptions, ProgressMessage, ProgressStream,
};
use dockmate::{ConnectionStorage, DockerError, Result, Settings};

pub type LogFeed = feed::UnboundedSender<Result<LogOutput>>;

#[derive(Default)]
pub struct MockState {
    pub containers: Vec<ContainerSummary>,
    pub images: Vec<ImageSummary>,
    pub inspect: HashMap<String, ContainerInspectResponse>,
    pub list_container_calls: usize,
    pub list_image_calls: usize,
    pub fail_list_containers: bool,
    pub fail_list_images: bool,
    pub created: Vec<Option<String>>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub killed: Vec<String>,
    pub paused: Vec<String>,
    pub unpaused: Vec<String>,
    pub removed: Vec<String>,
    pub committed: Vec<(CommitOptions, ContainerConfig)>,
    pub tagged: Vec<(String, String, String)>,
    pub removed_images: Vec<(String, bool)>,
    pub wait_code: i64,
    pub log_feeds: VecDeque<feed::UnboundedReceiver<Result<LogOutput>>>,
    pub log_calls: Vec<(String, LogOptions)>,
    pub always_time_out: bool,
    pub attach_sessions: VecDeque<AttachStreams>,
    pub build_messages: Vec<ProgressMessage>,
    pub build_contexts: Vec<usize>,
    pub pull_messages: Vec<ProgressMessage>,
}

/// In-memory daemon recording every call made through `DockerApi`.
#[derive(Default)]
pub struct MockDocker {
    state: Mutex<MockState>,
}

impl MockDocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, id: &str, name: &str, status: &str, running: bool, tty: bool) {
        let mut state = self.state();
        state.containers.push(summary(id, name, status));
        state.inspect.insert(id.to_string(), inspect(id, name, running, tty));
    }

    pub fn add_image(&self, id: &str, parent: &str, tags: &[&str]) {
        self.state().images.push(image(id, parent, tags));
    }

    /// The next `logs` call streams whatever is sent on the returned feed.
    pub fn feed_logs(&self) -> LogFeed {
        let (tx, rx) = feed::unbounded();
        self.state().log_feeds.push_back(rx);
        tx
    }
}

pub fn summary(id: &str, name: &str, status: &str) -> ContainerSummary {
    ContainerSummary {
        id: Some(id.to_string()),
        names: Some(vec![format!("/{}", name)]),
        image: Some("busybox:latest".to_string()),
        status: Some(status.to_string()),
        state: Some("running".to_string()),
        created: Some(1_600_000_000),
        ..Default::default()
    }
}

pub fn image(id: &str, parent: &str, tags: &[&str]) -> ImageSummary {
    ImageSummary {
        id: id.to_string(),
        parent_id: parent.to_string(),
        repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        created: 1_600_000_000,
        size: 1024,
        virtual_size: 1024,
        ..Default::default()
    }
}

pub fn inspect(id: &str, name: &str, running: bool, tty: bool) -> ContainerInspectResponse {
    ContainerInspectResponse {
        id: Some(id.to_string()),
        name: Some(format!("/{}", name)),
        state: Some(ContainerState {
            running: Some(running),
            ..Default::default()
        }),
        config: Some(ContainerConfig {
            image: Some("busybox:latest".to_string()),
            tty: Some(tty),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn stdout(text: &str) -> Result<LogOutput> {
    Ok(LogOutput::StdOut {
        message: Bytes::from(text.to_string()),
    })
}

pub fn console(bytes: &[u8]) -> Result<LogOutput> {
    Ok(LogOutput::Console {
        message: Bytes::copy_from_slice(bytes),
    })
}

pub fn status(text: &str) -> ProgressMessage {
    ProgressMessage {
        stream: Some(text.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl DockerApi for MockDocker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn info(&self) -> Result<ConnectionInfo> {
        let state = self.state();
        Ok(ConnectionInfo {
            containers: state.containers.len() as i64,
            images: state.images.len() as i64,
            server_version: Some("24.0.0".to_string()),
            ..Default::default()
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut state = self.state();
        state.list_container_calls += 1;
        if state.fail_list_containers {
            return Err(DockerError::daemon("daemon unavailable"));
        }
        Ok(state.containers.clone())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.state()
            .inspect
            .get(id)
            .cloned()
            .ok_or_else(|| DockerError::ContainerNotFound(id.to_string()))
    }

    async fn create_container(&self, _config: Config<String>, name: Option<&str>) -> Result<String> {
        let mut state = self.state();
        state.created.push(name.map(str::to_string));
        let id = format!("created{}", state.created.len());
        state.containers.push(summary(&id, name.unwrap_or("random_name"), "Created"));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.state().started.push(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<()> {
        self.state().stopped.push(id.to_string());
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.state().killed.push(id.to_string());
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.state().paused.push(id.to_string());
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.state().unpaused.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.removed.push(id.to_string());
        state.containers.retain(|c| c.id.as_deref() != Some(id));
        Ok(())
    }

    async fn commit_container(&self, options: CommitOptions, config: ContainerConfig) -> Result<String> {
        self.state().committed.push((options, config));
        Ok("sha256:committed".to_string())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64> {
        Ok(self.state().wait_code)
    }

    fn logs(&self, id: &str, options: LogOptions) -> LogChunks {
        let mut state = self.state();
        state.log_calls.push((id.to_string(), options));
        if let Some(rx) = state.log_feeds.pop_front() {
            return rx.boxed();
        }
        if state.always_time_out {
            return stream::iter(vec![Err(DockerError::Timeout)]).boxed();
        }
        stream::empty().boxed()
    }

    async fn attach_container(&self, id: &str) -> Result<AttachStreams> {
        self.state()
            .attach_sessions
            .pop_front()
            .ok_or_else(|| DockerError::ContainerNotFound(id.to_string()))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let mut state = self.state();
        state.list_image_calls += 1;
        if state.fail_list_images {
            return Err(DockerError::daemon("daemon unavailable"));
        }
        Ok(state.images.clone())
    }

    async fn inspect_image(&self, id: &str) -> Result<ImageInspect> {
        let state = self.state();
        match state.images.iter().find(|i| i.id == id) {
            Some(image) => Ok(ImageInspect {
                id: Some(image.id.clone()),
                repo_tags: Some(image.repo_tags.clone()),
                ..Default::default()
            }),
            None => Err(DockerError::daemon(format!("No such image: {}", id))),
        }
    }

    async fn search_images(&self, term: &str) -> Result<Vec<ImageSearchResult>> {
        Ok(vec![ImageSearchResult {
            name: term.to_string(),
            description: "mock".to_string(),
            official: true,
            automated: false,
            stars: 1,
        }])
    }

    fn pull_image(&self, _image: &str) -> ProgressStream {
        let messages = self.state().pull_messages.clone();
        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    fn push_image(&self, _image: &str) -> ProgressStream {
        stream::empty().boxed()
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        let mut state = self.state();
        state
            .tagged
            .push((image.to_string(), repo.to_string(), tag.to_string()));
        let reference = format!("{}:{}", repo, tag);
        if let Some(raw) = state.images.iter_mut().find(|i| i.id == image) {
            raw.repo_tags.push(reference);
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        self.state().removed_images.push((image.to_string(), force));
        Ok(())
    }

    fn build_image(&self, context: Vec<u8>, _name: Option<&str>) -> ProgressStream {
        let mut state = self.state();
        state.build_contexts.push(context.len());
        let messages = state.build_messages.clone();
        stream::iter(messages.into_iter().map(Ok)).boxed()
    }
}

pub struct MockFactory {
    pub client: Arc<MockDocker>,
    pub fail_hosts: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
}

impl MockFactory {
    pub fn new(client: Arc<MockDocker>) -> Arc<Self> {
        Arc::new(Self {
            client,
            fail_hosts: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn fail_for(&self, uri: &str) {
        self.fail_hosts.lock().unwrap().push(uri.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn DockerApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_hosts
            .lock()
            .unwrap()
            .iter()
            .any(|h| h == transport.uri())
        {
            return Err(DockerError::daemon("certificate rejected"));
        }
        Ok(self.client.clone())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    pub saved: Mutex<Vec<ConnectionDescriptor>>,
    pub saves: AtomicUsize,
    pub fail_saves: AtomicBool,
}

impl MemoryStorage {
    pub fn with(descriptors: Vec<ConnectionDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            saved: Mutex::new(descriptors),
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.saved.lock().unwrap().iter().map(|d| d.name.clone()).collect()
    }
}

#[async_trait]
impl ConnectionStorage for MemoryStorage {
    async fn load(&self) -> Result<Vec<ConnectionDescriptor>> {
        Ok(self.saved.lock().unwrap().clone())
    }

    async fn save(&self, connections: &[ConnectionDescriptor]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(DockerError::Storage("disk full".to_string()));
        }
        *self.saved.lock().unwrap() = connections.to_vec();
        Ok(())
    }
}

/// Settings with short delays so workers react quickly.
pub fn fast_settings() -> Arc<Settings> {
    Arc::new(Settings {
        log_initial_delay_ms: 0,
        log_poll_delay_ms: 10,
        stop_poll_interval_ms: 10,
        ..Settings::default()
    })
}

pub async fn open_connection(client: Arc<MockDocker>) -> Connection {
    open_connection_with(client, fast_settings()).await
}

pub async fn open_connection_with(client: Arc<MockDocker>, settings: Arc<Settings>) -> Connection {
    let connection = dockmate::ConnectionBuilder::new("mock", settings, MockFactory::new(client))
        .unix_socket("/var/run/docker.sock")
        .build()
        .unwrap();
    connection.open().await.unwrap();
    connection
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
