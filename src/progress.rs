use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::container_management::{ProgressMessage, ProgressStream};
use crate::error::{DockerError, Result};

const BUILD_COMPLETE: &str = "Successfully built";
const BUILD_STEP: &str = "Step ";

/// Receives the messages of a build, pull or push in order.
#[async_trait]
pub trait ProgressHandler: Send {
    async fn process_message(&mut self, message: ProgressMessage) -> Result<()>;
}

/// Something that displays how far a long running operation got.
pub trait ProgressMonitor: Send + Sync {
    fn begin(&self, task: &str);
    fn set_percentage(&self, percent: u8);
    fn cancel(&self);
    fn done(&self);
}

/// Monitor for callers that do not display progress.
pub struct NoProgress;

impl ProgressMonitor for NoProgress {
    fn begin(&self, _task: &str) {}
    fn set_percentage(&self, _percent: u8) {}
    fn cancel(&self) {}
    fn done(&self) {}
}

/// Feeds every message of `stream` to `handler`.
///
/// Returns the image id the daemon announced, if any.
pub async fn relay<H>(mut stream: ProgressStream, handler: &mut H) -> Result<Option<String>>
where
    H: ProgressHandler + ?Sized,
{
    let mut image_id = None;
    while let Some(message) = stream.next().await {
        let message = message?;
        if message.image_id.is_some() {
            image_id = message.image_id.clone();
        }
        handler.process_message(message).await?;
    }
    Ok(image_id)
}

/// Console output of a build. Appending never blocks; a background task
/// does the writing.
pub struct BuildConsole {
    lines: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

impl BuildConsole {
    pub fn new<W>(mut out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (lines, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = out.write_all(text.as_bytes()).await {
                    warn!("Writing to the build console failed: {}", e);
                    return;
                }
                let _ = out.flush().await;
            }
            let _ = out.shutdown().await;
        });
        Self { lines, writer }
    }

    pub fn append(&self, text: &str) {
        let _ = self.lines.send(text.to_string());
    }

    /// Flushes what is queued and closes the output.
    pub async fn close(self) {
        drop(self.lines);
        if let Err(e) = self.writer.await {
            warn!("Build console writer panicked: {}", e);
        }
    }
}

/// Number of instructions in a Dockerfile: lines that are neither blank nor comments.
pub async fn count_dockerfile_instructions(path: &Path) -> Result<usize> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count())
}

/// Percentage reached by the last `Step N` marker of `text`.
///
/// Several steps may arrive in one message, so the last marker wins.
pub fn step_percentage(text: &str, lines: usize) -> Option<u8> {
    if lines == 0 {
        return None;
    }
    let start = text.rfind(BUILD_STEP)? + BUILD_STEP.len();
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let step: usize = digits.parse().ok()?;
    // build output may echo arbitrary "Step" text
    let percentage = step.checked_add(1)?.checked_mul(100)? / lines;
    Some(percentage.min(100) as u8)
}

/// Turns build messages into percentages, console output and an image
/// refresh once the build succeeded.
pub struct BuildProgressRelay {
    image: String,
    lines: usize,
    connection: Option<Connection>,
    monitor: Arc<dyn ProgressMonitor>,
    console: Option<BuildConsole>,
    started: bool,
}

impl BuildProgressRelay {
    /// `lines` is the instruction count of the Dockerfile being built.
    pub fn new(image: impl Into<String>, lines: usize, monitor: Arc<dyn ProgressMonitor>) -> Self {
        Self {
            image: image.into(),
            lines,
            connection: None,
            monitor,
            console: None,
            started: false,
        }
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_console(mut self, console: BuildConsole) -> Self {
        self.console = Some(console);
        self
    }

    pub async fn finish(self) {
        if self.started {
            self.monitor.done();
        }
        if let Some(console) = self.console {
            console.close().await;
        }
    }
}

#[async_trait]
impl ProgressHandler for BuildProgressRelay {
    async fn process_message(&mut self, mut message: ProgressMessage) -> Result<()> {
        if let Some(error) = message.error.take() {
            self.monitor.cancel();
            return Err(DockerError::BuildFailed {
                image: self.image.clone(),
                message: error,
            });
        }

        let text = message.stream.or(message.status).unwrap_or_default();
        if !self.started {
            self.monitor.begin(&format!("Building image {}", self.image));
            self.started = true;
        }
        if text.starts_with(BUILD_COMPLETE) {
            self.monitor.set_percentage(100);
            match &self.connection {
                Some(connection) => {
                    if let Err(e) = connection.images(true).await {
                        warn!("Refreshing images after building {} failed: {}", self.image, e);
                    }
                }
                None => debug!("Built {} without a connection to refresh", self.image),
            }
        } else if let Some(percentage) = step_percentage(&text, self.lines) {
            self.monitor.set_percentage(percentage);
        }

        if let Some(console) = &self.console {
            console.append(&text);
        }
        Ok(())
    }
}

/// Relays pull and push messages to a console. An error message aborts the transfer.
pub struct TransferProgressRelay {
    image: String,
    monitor: Arc<dyn ProgressMonitor>,
    console: Option<BuildConsole>,
    started: bool,
}

impl TransferProgressRelay {
    pub fn new(image: impl Into<String>, monitor: Arc<dyn ProgressMonitor>) -> Self {
        Self {
            image: image.into(),
            monitor,
            console: None,
            started: false,
        }
    }

    pub fn with_console(mut self, console: BuildConsole) -> Self {
        self.console = Some(console);
        self
    }

    pub async fn finish(self) {
        if self.started {
            self.monitor.done();
        }
        if let Some(console) = self.console {
            console.close().await;
        }
    }
}

#[async_trait]
impl ProgressHandler for TransferProgressRelay {
    async fn process_message(&mut self, mut message: ProgressMessage) -> Result<()> {
        if let Some(error) = message.error.take() {
            self.monitor.cancel();
            return Err(DockerError::ImageTransfer {
                image: self.image.clone(),
                message: error,
            });
        }
        if !self.started {
            self.monitor.begin(&format!("Transferring image {}", self.image));
            self.started = true;
        }
        if let Some(console) = &self.console {
            let mut line = String::new();
            if let Some(id) = &message.id {
                line.push_str(id);
                line.push_str(": ");
            }
            line.push_str(message.text().unwrap_or_default());
            if let Some(progress) = &message.progress {
                line.push(' ');
                line.push_str(progress);
            }
            line.push('\n');
            console.append(&line);
        }
        Ok(())
    }
}
