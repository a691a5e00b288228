mod transport;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use bollard::container::Config;
use bollard::models::ImageInspect;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};

pub use transport::Transport;

use crate::attach::{self, AttachOptions, AttachSession};
use crate::container_management::{
    ClientFactory, CommitOptions, ConnectionInfo, Container, ContainerInfo, DockerApi, Image,
    ImageSearchResult,
};
use crate::error::{DockerError, Result};
use crate::events::ConnectionEvent;
use crate::io::handler::ConnectionHandler;
use crate::io::Command;
use crate::log_worker::{LogSink, LoggingStatus};
use crate::progress::{self, ProgressHandler};
use crate::settings::Settings;

const COMMAND_QUEUE_SIZE: usize = 100;
const EVENT_CAPACITY: usize = 64;

/// What gets persisted about a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub transport: Transport,
}

pub struct ConnectionBuilder {
    name: String,
    transport: Option<Result<Transport>>,
    settings: Arc<Settings>,
    factory: Arc<dyn ClientFactory>,
}

impl ConnectionBuilder {
    pub fn new(name: impl Into<String>, settings: Arc<Settings>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            settings,
            factory,
        }
    }

    pub fn unix_socket(mut self, path: &str) -> Self {
        self.transport = Some(Transport::unix_socket(path));
        self
    }

    pub fn tcp(mut self, host: &str, cert_path: Option<PathBuf>) -> Self {
        self.transport = Some(Transport::tcp(host, cert_path));
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(Ok(transport));
        self
    }

    pub fn build(self) -> Result<Connection> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DockerError::Config("connection name is empty".to_string()));
        }
        let transport = match self.transport {
            Some(transport) => transport?,
            None => {
                return Err(DockerError::Config(format!(
                    "connection '{}' has no unix socket or tcp host",
                    name
                )))
            }
        };
        Ok(Connection::new(name, transport, self.settings, self.factory))
    }
}

/// A named endpoint of a Docker daemon.
///
/// Cloning is cheap and every clone refers to the same connection. While open,
/// a handler task owns the client, the caches and the log workers; this
/// handle talks to it over a command queue.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<RwLock<String>>,
    transport: Transport,
    settings: Arc<Settings>,
    factory: Arc<dyn ClientFactory>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    open_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("uri", &self.uri())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    fn new(
        name: String,
        transport: Transport,
        settings: Arc<Settings>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                name: Arc::new(RwLock::new(name)),
                transport,
                settings,
                factory,
                commands: Mutex::new(None),
                open_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn from_descriptor(
        descriptor: ConnectionDescriptor,
        settings: Arc<Settings>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self::new(descriptor.name, descriptor.transport, settings, factory)
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            name: self.name(),
            transport: self.inner.transport.clone(),
        }
    }

    pub fn name(&self) -> String {
        match self.inner.name.read() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Changes the display name. The registry must be told with `notify_rename`.
    pub fn set_name(&self, name: &str) {
        match self.inner.name.write() {
            Ok(mut current) => *current = name.to_string(),
            Err(poisoned) => *poisoned.into_inner() = name.to_string(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn uri(&self) -> &str {
        self.inner.transport.uri()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        match self.inner.commands.lock() {
            Ok(commands) => commands.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn take_sender(&self) -> Option<mpsc::Sender<Command>> {
        match self.inner.commands.lock() {
            Ok(mut commands) => commands.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sender().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Acquires a client for the transport and starts the handler task.
    /// Opening an open connection does nothing.
    pub async fn open(&self) -> Result<()> {
        let _guard = self.inner.open_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }
        let client = self
            .inner
            .factory
            .connect(&self.inner.transport)
            .await
            .map_err(|e| match e {
                DockerError::Open { .. } => e,
                other => DockerError::Open {
                    name: self.name(),
                    message: other.to_string(),
                },
            })?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let handler = ConnectionHandler::new(
            Arc::clone(&self.inner.name),
            client,
            Arc::clone(&self.inner.settings),
            self.inner.events.clone(),
            tx.downgrade(),
        );
        tokio::spawn(handler.run(rx));
        match self.inner.commands.lock() {
            Ok(mut commands) => *commands = Some(tx),
            Err(poisoned) => *poisoned.into_inner() = Some(tx),
        }
        info!("Opened connection '{}' to {}", self.name(), self.uri());
        Ok(())
    }

    /// Stops the handler task, its log workers and releases the client.
    pub async fn close(&self) {
        let _guard = self.inner.open_lock.lock().await;
        if let Some(tx) = self.take_sender() {
            let _ = tx.send(Command::Close).await;
            info!("Closed connection '{}'", self.name());
        }
    }

    fn closed(&self) -> DockerError {
        DockerError::Closed(self.name())
    }

    async fn send(&self, command: Command) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| DockerError::NotOpen(self.name()))?;
        tx.send(command).await.map_err(|_| self.closed())
    }

    async fn request<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// The client handle owned by the handler task.
    pub async fn client(&self) -> Result<Arc<dyn DockerApi>> {
        self.request(Command::Client).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.client().await?.ping().await
    }

    pub async fn info(&self) -> Result<ConnectionInfo> {
        self.client().await?.info().await
    }

    /// Cached containers, fetched on first use or when `force` is set.
    /// Listing failures leave an empty cache behind.
    pub async fn containers(&self, force: bool) -> Result<Arc<Vec<Container>>> {
        self.request(|reply| Command::Containers {
            force,
            reply: Some(reply),
        })
        .await
    }

    pub async fn images(&self, force: bool) -> Result<Arc<Vec<Image>>> {
        self.request(|reply| Command::Images {
            force,
            reply: Some(reply),
        })
        .await
    }

    pub async fn containers_loaded(&self) -> bool {
        self.request(Command::ContainersLoaded).await.unwrap_or(false)
    }

    pub async fn images_loaded(&self) -> bool {
        self.request(Command::ImagesLoaded).await.unwrap_or(false)
    }

    async fn refresh_containers(&self) -> Result<()> {
        self.containers(true).await.map(|_| ())
    }

    async fn refresh_images(&self) -> Result<()> {
        self.images(true).await.map(|_| ())
    }

    pub async fn container(&self, id: &str) -> Result<Option<Container>> {
        let containers = self.containers(false).await?;
        Ok(containers.iter().find(|c| c.id == id).cloned())
    }

    /// Inspects a container; failures are logged and give `None`.
    pub async fn container_info(&self, id: &str) -> Option<ContainerInfo> {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        match client.inspect_container(id).await {
            Ok(raw) => Some(ContainerInfo::new(raw)),
            Err(e) => {
                warn!("Inspecting container {} on '{}' failed: {}", id, self.name(), e);
                None
            }
        }
    }

    pub async fn image_info(&self, id: &str) -> Option<ImageInspect> {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        match client.inspect_image(id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Inspecting image {} on '{}' failed: {}", id, self.name(), e);
                None
            }
        }
    }

    /// Whether a cached image of `repo` carries a tag starting with `tag`.
    pub async fn has_image(&self, repo: &str, tag: &str) -> Result<bool> {
        let images = self.images(false).await?;
        Ok(images
            .iter()
            .any(|image| image.repo == repo && image.tags.iter().any(|t| t.starts_with(tag))))
    }

    pub async fn search_images(&self, term: &str) -> Result<Vec<ImageSearchResult>> {
        self.client().await?.search_images(term).await
    }

    /// Creates a container; without a name the daemon picks one.
    pub async fn create_container(&self, config: Config<String>, name: Option<&str>) -> Result<String> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let id = self.client().await?.create_container(config, name).await?;
        info!("Created container {} on '{}'", id, self.name());
        self.refresh_containers().await?;
        Ok(id)
    }

    /// Starts a container. With a sink, the output of a non-tty container is
    /// logged into it.
    pub async fn start_container(&self, id: &str, sink: Option<LogSink>) -> Result<()> {
        self.start_container_with_logging_id(id, id, sink).await
    }

    /// Like `start_container`, with the log worker registered under `logging_id`.
    pub async fn start_container_with_logging_id(
        &self,
        id: &str,
        logging_id: &str,
        sink: Option<LogSink>,
    ) -> Result<()> {
        let client = self.client().await?;
        client.start_container(id).await?;
        if let Some(sink) = sink {
            self.log_started(id, logging_id, sink).await?;
        }
        self.refresh_containers().await
    }

    /// The container already runs, so an inspect failure only skips logging.
    async fn log_started(&self, id: &str, logging_id: &str, mut sink: LogSink) -> Result<()> {
        if self.settings().auto_log_on_start {
            if let Some(info) = self.container_info(id).await {
                if !info.tty() {
                    self.start_logging(id, logging_id, true, sink).await?;
                    return Ok(());
                }
            }
        }
        // nobody will write to it
        let _ = sink.shutdown().await;
        Ok(())
    }

    /// Stops a container along with its log worker.
    pub async fn stop_container(&self, id: &str) -> Result<()> {
        self.forget_logging(id).await;
        self.client()
            .await?
            .stop_container(id, self.settings().stop_timeout_secs)
            .await?;
        self.refresh_containers().await
    }

    pub async fn kill_container(&self, id: &str) -> Result<()> {
        self.forget_logging(id).await;
        self.client().await?.kill_container(id).await?;
        self.refresh_containers().await
    }

    pub async fn pause_container(&self, id: &str) -> Result<()> {
        self.client().await?.pause_container(id).await?;
        self.refresh_containers().await
    }

    pub async fn unpause_container(&self, id: &str, sink: Option<LogSink>) -> Result<()> {
        let client = self.client().await?;
        client.unpause_container(id).await?;
        if let Some(sink) = sink {
            self.log_started(id, id, sink).await?;
        }
        self.refresh_containers().await
    }

    pub async fn remove_container(&self, id: &str) -> Result<()> {
        self.client().await?.remove_container(id).await?;
        self.refresh_containers().await
    }

    /// Commits a container to a new image using its current configuration.
    pub async fn commit_container(&self, options: CommitOptions) -> Result<String> {
        let client = self.client().await?;
        let info = ContainerInfo::new(client.inspect_container(&options.container).await?);
        let config = info.config().cloned().unwrap_or_default();
        let image = client.commit_container(options, config).await?;
        self.refresh_images().await?;
        Ok(image)
    }

    /// Blocks until the container exits and returns its exit code.
    pub async fn wait_for_container(&self, id: &str) -> Result<i64> {
        let code = self.client().await?.wait_container(id).await?;
        self.refresh_containers().await?;
        Ok(code)
    }

    pub async fn pull_image<H>(&self, image: &str, handler: &mut H) -> Result<()>
    where
        H: ProgressHandler + ?Sized,
    {
        let stream = self.client().await?.pull_image(image);
        progress::relay(stream, handler).await?;
        self.refresh_images().await
    }

    pub async fn push_image<H>(&self, image: &str, handler: &mut H) -> Result<()>
    where
        H: ProgressHandler + ?Sized,
    {
        let stream = self.client().await?.push_image(image);
        progress::relay(stream, handler).await?;
        self.refresh_images().await
    }

    pub async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        self.client().await?.tag_image(image, repo, tag).await?;
        self.refresh_images().await
    }

    /// Forcibly removes an image.
    pub async fn remove_image(&self, image: &str) -> Result<()> {
        self.client().await?.remove_image(image, true).await?;
        self.refresh_images().await
    }

    /// Removes one tag; the image goes away with its last tag.
    pub async fn remove_tag(&self, tag: &str) -> Result<()> {
        self.client().await?.remove_image(tag, false).await?;
        self.refresh_images().await
    }

    /// Builds the image described by `dir/Dockerfile` and returns its id.
    pub async fn build_image<H>(&self, dir: &Path, name: Option<&str>, handler: &mut H) -> Result<Option<String>>
    where
        H: ProgressHandler + ?Sized,
    {
        let context = build_context(dir.to_path_buf()).await?;
        debug!("Build context of {} is {} bytes", dir.display(), context.len());
        let stream = self.client().await?.build_image(context, name);
        let image_id = progress::relay(stream, handler).await?;
        self.refresh_images().await?;
        Ok(image_id)
    }

    /// Streams the container's output into `sink`, following it while the
    /// container runs. Returns `false` when the container is already logged.
    pub async fn log_container(&self, id: &str, sink: LogSink) -> Result<bool> {
        let info = ContainerInfo::new(self.client().await?.inspect_container(id).await?);
        self.start_logging(id, id, info.running(), sink).await
    }

    async fn start_logging(&self, id: &str, logging_id: &str, follow: bool, sink: LogSink) -> Result<bool> {
        self.request(|reply| Command::StartLogging {
            container_id: id.to_string(),
            logging_id: logging_id.to_string(),
            follow,
            sink,
            reply,
        })
        .await
    }

    pub async fn logging_status(&self, logging_id: &str) -> LoggingStatus {
        self.request(|reply| Command::LoggingStatus {
            logging_id: logging_id.to_string(),
            reply,
        })
        .await
        .unwrap_or(LoggingStatus::None)
    }

    async fn forget_logging(&self, logging_id: &str) {
        let command = Command::StopLogging {
            logging_id: logging_id.to_string(),
            remove: true,
        };
        if let Err(e) = self.send(command).await {
            debug!("Stopping log worker of {}: {}", logging_id, e);
        }
    }

    /// Stops a log worker and waits until it no longer reports being active.
    pub async fn stop_logging(&self, logging_id: &str) -> Result<()> {
        self.send(Command::StopLogging {
            logging_id: logging_id.to_string(),
            remove: false,
        })
        .await?;
        let interval = self.settings().stop_poll_interval();
        while self.logging_status(logging_id).await == LoggingStatus::Active {
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }

    pub async fn stop_all_logging(&self) {
        if let Err(e) = self.send(Command::StopAllLogging).await {
            debug!("Stopping log workers of '{}': {}", self.name(), e);
        }
    }

    /// Attaches `input` and `output` to the container's console.
    pub async fn attach<R, W>(&self, id: &str, input: R, output: W) -> Result<AttachSession>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let options = AttachOptions::from_settings(self.settings());
        self.attach_with(id, input, output, options).await
    }

    pub async fn attach_with<R, W>(
        &self,
        id: &str,
        input: R,
        output: W,
        options: AttachOptions,
    ) -> Result<AttachSession>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let client = self.client().await?;
        attach::attach(client, id, input, output, options).await
    }
}

async fn build_context(dir: PathBuf) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", &dir)?;
        Ok(archive.into_inner()?)
    })
    .await
    .map_err(|e| DockerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
