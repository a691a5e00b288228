use std::sync::{Arc, RwLock};

use log::{debug, error, info};
use tokio::sync::{broadcast, mpsc};

use super::Command;

use crate::container_management::{containers_from_summaries, images_from_summaries, Container, DockerApi, Image};
use crate::error::DockerError;
use crate::events::ConnectionEvent;
use crate::log_worker::{LogWorker, LogWorkers};
use crate::settings::Settings;

/// Owns the client handle, caches and log workers of one open connection.
///
/// Every refresh goes through the command queue, so two refreshes of the same
/// cache never interleave. Events are broadcast once the cache is replaced.
pub struct ConnectionHandler {
    name: Arc<RwLock<String>>,
    client: Arc<dyn DockerApi>,
    settings: Arc<Settings>,
    events: broadcast::Sender<ConnectionEvent>,
    commands: mpsc::WeakSender<Command>,
    containers: Option<Arc<Vec<Container>>>,
    images: Option<Arc<Vec<Image>>>,
    workers: LogWorkers,
}

impl ConnectionHandler {
    pub fn new(
        name: Arc<RwLock<String>>,
        client: Arc<dyn DockerApi>,
        settings: Arc<Settings>,
        events: broadcast::Sender<ConnectionEvent>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            name,
            client,
            settings,
            events,
            commands,
            containers: None,
            images: None,
            workers: LogWorkers::new(),
        }
    }

    fn name(&self) -> String {
        match self.name.read() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if let Command::Close = command {
                break;
            }
            self.handle_command(command).await;
        }
        self.workers.stop_all();
        info!("Connection '{}' handler stopped", self.name());
    }

    pub async fn handle_command(&mut self, command: Command) {
        debug!("{}: {:?}", self.name(), command);
        match command {
            Command::Client(reply) => {
                let _ = reply.send(Arc::clone(&self.client));
            }
            Command::Containers { force, reply } => {
                let containers = self.containers(force).await;
                if let Some(reply) = reply {
                    let _ = reply.send(containers);
                }
            }
            Command::Images { force, reply } => {
                let images = self.images(force).await;
                if let Some(reply) = reply {
                    let _ = reply.send(images);
                }
            }
            Command::ContainersLoaded(reply) => {
                let _ = reply.send(self.containers.is_some());
            }
            Command::ImagesLoaded(reply) => {
                let _ = reply.send(self.images.is_some());
            }
            Command::StartLogging {
                container_id,
                logging_id,
                follow,
                sink,
                reply,
            } => {
                let client = Arc::clone(&self.client);
                let settings = Arc::clone(&self.settings);
                let refresh = self.commands.clone();
                let started = self.workers.start(logging_id, sink, |sink| {
                    LogWorker::spawn(client, container_id, follow, sink, settings, refresh)
                });
                let _ = reply.send(started);
            }
            Command::StopLogging { logging_id, remove } => self.workers.stop(&logging_id, remove),
            Command::LoggingStatus { logging_id, reply } => {
                let _ = reply.send(self.workers.status(&logging_id));
            }
            Command::StopAllLogging => self.workers.stop_all(),
            Command::Close => {}
        }
    }

    async fn containers(&mut self, force: bool) -> Arc<Vec<Container>> {
        match &self.containers {
            Some(cached) if !force => Arc::clone(cached),
            _ => self.refresh_containers().await,
        }
    }

    async fn images(&mut self, force: bool) -> Arc<Vec<Image>> {
        match &self.images {
            Some(cached) if !force => Arc::clone(cached),
            _ => self.refresh_images().await,
        }
    }

    async fn refresh_containers(&mut self) -> Arc<Vec<Container>> {
        match self.client.list_containers().await {
            Ok(raw) => {
                let listing = containers_from_summaries(raw);
                self.workers.forget_exited(&listing.exited);
                let containers = Arc::new(listing.containers);
                self.containers = Some(Arc::clone(&containers));
                let _ = self
                    .events
                    .send(ConnectionEvent::ContainersChanged(Arc::clone(&containers)));
                containers
            }
            Err(e) => {
                let err = DockerError::ListContainers {
                    connection: self.name(),
                    message: e.to_string(),
                };
                error!("{}", err);
                let empty = Arc::new(Vec::new());
                self.containers = Some(Arc::clone(&empty));
                empty
            }
        }
    }

    async fn refresh_images(&mut self) -> Arc<Vec<Image>> {
        match self.client.list_images().await {
            Ok(raw) => {
                let images = Arc::new(images_from_summaries(raw));
                self.images = Some(Arc::clone(&images));
                let _ = self
                    .events
                    .send(ConnectionEvent::ImagesChanged(Arc::clone(&images)));
                images
            }
            Err(e) => {
                let err = DockerError::ListImages {
                    connection: self.name(),
                    message: e.to_string(),
                };
                error!("{}", err);
                let empty = Arc::new(Vec::new());
                self.images = Some(Arc::clone(&empty));
                empty
            }
        }
    }
}
