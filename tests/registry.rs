mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use common::*;
use dockmate::connection::{ConnectionDescriptor, Transport};
use dockmate::{ConnectionRegistry, DockerError, LoggingStatus, RegistryEventKind};

fn registry(mock: Arc<MockDocker>, storage: Arc<MemoryStorage>) -> (ConnectionRegistry, Arc<MockFactory>) {
    let factory = MockFactory::new(mock);
    let registry = ConnectionRegistry::new(storage, factory.clone(), fast_settings());
    (registry, factory)
}

fn descriptor(name: &str, host: &str) -> ConnectionDescriptor {
    ConnectionDescriptor {
        name: name.to_string(),
        transport: Transport::tcp(host, None).unwrap(),
    }
}

#[tokio::test]
async fn added_connections_are_opened_persisted_and_announced() {
    let storage = MemoryStorage::with(Vec::new());
    let (registry, _) = registry(MockDocker::new(), storage.clone());
    let mut events = registry.subscribe();

    let conn = registry
        .builder("local")
        .unix_socket("/var/run/docker.sock")
        .build()
        .unwrap();
    registry.add(conn.clone()).await.unwrap();

    assert!(conn.is_open());
    assert_eq!(storage.names(), vec!["local"]);
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, RegistryEventKind::Added);
    assert!(event.connection.ptr_eq(&conn));
    assert!(registry.find("local").await.unwrap().ptr_eq(&conn));
    assert!(registry.find("other").await.is_none());
}

#[tokio::test]
async fn names_must_be_unique() {
    let storage = MemoryStorage::with(Vec::new());
    let (registry, _) = registry(MockDocker::new(), storage.clone());

    let first = registry.builder("dev").tcp("docker:2375", None).build().unwrap();
    registry.add(first).await.unwrap();
    let second = registry.builder("dev").tcp("other:2375", None).build().unwrap();
    let err = registry.add(second.clone()).await.unwrap_err();

    assert!(matches!(err, DockerError::DuplicateConnection(ref n) if n == "dev"));
    assert!(!second.is_open());
    assert_eq!(registry.names().await, vec!["dev"]);
}

#[tokio::test]
async fn open_failures_propagate_from_add() {
    let storage = MemoryStorage::with(Vec::new());
    let (registry, factory) = registry(MockDocker::new(), storage.clone());
    factory.fail_for("https://secure:2376");

    let conn = registry
        .builder("secure")
        .tcp("secure:2376", Some("/certs".into()))
        .build()
        .unwrap();
    let err = registry.add(conn).await.unwrap_err();

    assert!(matches!(err, DockerError::Open { .. }));
    assert!(registry.is_empty().await);
    assert_eq!(storage.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reload_keeps_going_past_failed_connections() {
    let storage = MemoryStorage::with(vec![
        descriptor("broken", "bad:2375"),
        descriptor("good", "good:2375"),
    ]);
    let (registry, factory) = registry(MockDocker::new(), storage);
    factory.fail_for("http://bad:2375");
    let mut events = registry.subscribe();

    registry.reload().await.unwrap();

    assert_eq!(registry.names().await, vec!["broken", "good"]);
    assert!(!registry.find("broken").await.unwrap().is_open());
    assert!(registry.find("good").await.unwrap().is_open());
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, RegistryEventKind::Added);
    assert_eq!(event.connection.name(), "good");
    assert!(events.try_recv().is_err());
    assert_eq!(factory.connects(), 2);
}

#[tokio::test]
async fn removal_stops_log_workers() {
    let mock = MockDocker::new();
    mock.add_container("c1", "web", "Up 1 minute", true, false);
    let _feed = mock.feed_logs();
    let storage = MemoryStorage::with(Vec::new());
    let (registry, _) = registry(mock.clone(), storage.clone());

    let conn = registry.builder("local").unix_socket("/run/docker.sock").build().unwrap();
    registry.add(conn.clone()).await.unwrap();
    let (sink, mut out) = tokio::io::duplex(1024);
    conn.log_container("c1", Box::new(sink)).await.unwrap();
    assert_eq!(conn.logging_status("c1").await, LoggingStatus::Active);

    let mut events = registry.subscribe();
    registry.remove(&conn).await.unwrap();

    assert!(registry.find("local").await.is_none());
    assert!(storage.names().is_empty());
    assert_eq!(events.recv().await.unwrap().kind, RegistryEventKind::Removed);
    assert!(!conn.is_open());
    // the worker closes its sink once stopped
    let mut rest = Vec::new();
    out.read_to_end(&mut rest).await.unwrap();
}

#[tokio::test]
async fn renames_are_persisted_and_announced() {
    let storage = MemoryStorage::with(Vec::new());
    let (registry, _) = registry(MockDocker::new(), storage.clone());
    let a = registry.builder("a").tcp("a:2375", None).build().unwrap();
    let b = registry.builder("b").tcp("b:2375", None).build().unwrap();
    registry.add(a.clone()).await.unwrap();
    registry.add(b.clone()).await.unwrap();
    let mut events = registry.subscribe();

    registry.rename(&a, "staging").await.unwrap();
    assert_eq!(a.name(), "staging");
    assert_eq!(storage.names(), vec!["staging", "b"]);
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, RegistryEventKind::Renamed);
    assert!(event.connection.ptr_eq(&a));

    let err = registry.rename(&b, "staging").await.unwrap_err();
    assert!(matches!(err, DockerError::DuplicateConnection(_)));
    assert_eq!(b.name(), "b");
}

#[tokio::test]
async fn removal_completes_when_saving_fails() {
    let mock = MockDocker::new();
    mock.add_container("c1", "web", "Up 1 minute", true, false);
    let _feed = mock.feed_logs();
    let storage = MemoryStorage::with(vec![descriptor("local", "docker:2375")]);
    let (registry, _) = registry(mock.clone(), storage.clone());
    registry.reload().await.unwrap();
    let conn = registry.find("local").await.unwrap();
    let (sink, mut out) = tokio::io::duplex(1024);
    conn.log_container("c1", Box::new(sink)).await.unwrap();
    let mut events = registry.subscribe();

    storage.fail_saves.store(true, Ordering::SeqCst);
    let err = registry.remove(&conn).await.unwrap_err();

    assert!(matches!(err, DockerError::Storage(_)));
    assert!(registry.find("local").await.is_none());
    assert!(!conn.is_open());
    assert_eq!(events.recv().await.unwrap().kind, RegistryEventKind::Removed);
    let mut rest = Vec::new();
    out.read_to_end(&mut rest).await.unwrap();
}

#[tokio::test]
async fn add_is_undone_when_saving_fails() {
    let storage = MemoryStorage::with(Vec::new());
    storage.fail_saves.store(true, Ordering::SeqCst);
    let (registry, _) = registry(MockDocker::new(), storage.clone());
    let mut events = registry.subscribe();

    let conn = registry.builder("dev").tcp("docker:2375", None).build().unwrap();
    let err = registry.add(conn.clone()).await.unwrap_err();

    assert!(matches!(err, DockerError::Storage(_)));
    assert!(registry.is_empty().await);
    assert!(!conn.is_open());
    assert!(events.try_recv().is_err());
}
