mod storage;

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{broadcast, RwLock};

pub use storage::{ConnectionStorage, JsonConnectionStorage};

use crate::connection::{Connection, ConnectionBuilder, ConnectionDescriptor};
use crate::container_management::ClientFactory;
use crate::error::{DockerError, Result};
use crate::events::{RegistryEvent, RegistryEventKind};
use crate::settings::Settings;

const EVENT_CAPACITY: usize = 32;

/// The named connections of the application.
///
/// Events are published after the connection list lock is released.
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Connection>>,
    storage: Arc<dyn ConnectionStorage>,
    factory: Arc<dyn ClientFactory>,
    settings: Arc<Settings>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    pub fn new(
        storage: Arc<dyn ConnectionStorage>,
        factory: Arc<dyn ClientFactory>,
        settings: Arc<Settings>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connections: RwLock::new(Vec::new()),
            storage,
            factory,
            settings,
            events,
        }
    }

    /// Starts a connection sharing this registry's settings and client factory.
    pub fn builder(&self, name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(name, Arc::clone(&self.settings), Arc::clone(&self.factory))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, kind: RegistryEventKind, connection: &Connection) {
        // nobody listening is fine
        let _ = self.events.send(RegistryEvent::new(kind, connection.clone()));
    }

    async fn persist(&self) -> Result<()> {
        let descriptors: Vec<ConnectionDescriptor> = self
            .connections
            .read()
            .await
            .iter()
            .map(Connection::descriptor)
            .collect();
        self.storage.save(&descriptors).await
    }

    /// Replaces the connection list with the stored one and opens every
    /// connection. Connections that fail to open are kept, closed.
    pub async fn reload(&self) -> Result<()> {
        let descriptors = self.storage.load().await?;

        let mut restored = Vec::with_capacity(descriptors.len());
        let mut opened = Vec::new();
        for descriptor in descriptors {
            let connection = Connection::from_descriptor(
                descriptor,
                Arc::clone(&self.settings),
                Arc::clone(&self.factory),
            );
            match connection.open().await {
                Ok(()) => opened.push(connection.clone()),
                Err(e) => error!("Restoring connection '{}' failed: {}", connection.name(), e),
            }
            restored.push(connection);
        }

        let previous = {
            let mut connections = self.connections.write().await;
            std::mem::replace(&mut *connections, restored)
        };
        for connection in previous {
            connection.close().await;
        }

        info!("Restored {} connections, {} open", self.len().await, opened.len());
        for connection in &opened {
            self.publish(RegistryEventKind::Added, connection);
        }
        Ok(())
    }

    /// Opens and registers a connection. Names must be unique.
    pub async fn add(&self, connection: Connection) -> Result<()> {
        let name = connection.name();
        if self.find(&name).await.is_some() {
            return Err(DockerError::DuplicateConnection(name));
        }
        connection.open().await?;
        {
            let mut connections = self.connections.write().await;
            if connections.iter().any(|c| c.name() == name) {
                drop(connections);
                connection.close().await;
                return Err(DockerError::DuplicateConnection(name));
            }
            connections.push(connection.clone());
        }
        if let Err(e) = self.persist().await {
            error!("Saving connections after adding '{}' failed: {}", name, e);
            self.connections.write().await.retain(|c| !c.ptr_eq(&connection));
            connection.close().await;
            return Err(e);
        }
        info!("Added connection '{}' ({})", name, connection.uri());
        self.publish(RegistryEventKind::Added, &connection);
        Ok(())
    }

    /// Unregisters a connection, stops its log workers and closes it.
    ///
    /// A failure to save the list is returned once the removal is complete.
    pub async fn remove(&self, connection: &Connection) -> Result<()> {
        let removed = {
            let mut connections = self.connections.write().await;
            let before = connections.len();
            connections.retain(|c| !c.ptr_eq(connection));
            connections.len() != before
        };
        if !removed {
            warn!("Connection '{}' is not registered", connection.name());
            return Ok(());
        }
        let saved = self.persist().await;
        if let Err(e) = &saved {
            error!("Saving connections after removing '{}' failed: {}", connection.name(), e);
        }
        info!("Removed connection '{}'", connection.name());
        self.publish(RegistryEventKind::Removed, connection);
        connection.stop_all_logging().await;
        connection.close().await;
        saved
    }

    /// Persists a rename that already happened on `connection`.
    pub async fn notify_rename(&self, connection: &Connection) -> Result<()> {
        self.persist().await?;
        self.publish(RegistryEventKind::Renamed, connection);
        Ok(())
    }

    pub async fn rename(&self, connection: &Connection, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DockerError::Config("connection name is empty".to_string()));
        }
        if let Some(other) = self.find(name).await {
            if !other.ptr_eq(connection) {
                return Err(DockerError::DuplicateConnection(name.to_string()));
            }
        }
        connection.set_name(name);
        self.notify_rename(connection).await
    }

    pub async fn find(&self, name: &str) -> Option<Connection> {
        self.connections
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.connections.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.connections
            .read()
            .await
            .iter()
            .map(Connection::name)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
