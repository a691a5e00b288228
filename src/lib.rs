pub mod attach;
pub mod connection;
pub mod container_management;
pub mod error;
pub mod events;
pub mod io;
pub mod log_worker;
pub mod progress;
pub mod registry;
pub mod settings;

pub use connection::{Connection, ConnectionBuilder, ConnectionDescriptor, Transport};
pub use error::{DockerError, Result};
pub use events::{ConnectionEvent, RegistryEvent, RegistryEventKind};
pub use log_worker::{LogSink, LoggingStatus};
pub use registry::{ConnectionRegistry, ConnectionStorage, JsonConnectionStorage};
pub use settings::{Paths, Settings};
