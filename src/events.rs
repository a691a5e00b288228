use std::sync::Arc;

use crate::connection::Connection;
use crate::container_management::{Container, Image};

/// Published by a connection after one of its caches was replaced.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ContainersChanged(Arc<Vec<Container>>),
    ImagesChanged(Arc<Vec<Image>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    Added,
    Removed,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub connection: Connection,
}

impl RegistryEvent {
    pub fn new(kind: RegistryEventKind, connection: Connection) -> Self {
        Self { kind, connection }
    }
}
