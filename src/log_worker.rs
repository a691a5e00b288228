use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bollard::container::LogOutput;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::container_management::{DockerApi, LogOptions};
use crate::error::{DockerError, Result};
use crate::io::Command;
use crate::settings::Settings;

/// Where a worker writes the container output. Shut down when the worker ends.
pub type LogSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingStatus {
    /// No worker is known for the id.
    None,
    Active,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Stopped,
}

/// The bytes of a log chunk, whatever stream it came from.
pub(crate) fn payload(chunk: &LogOutput) -> &[u8] {
    match chunk {
        LogOutput::StdErr { message }
        | LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => &message[..],
    }
}

/// Handle on a background task streaming one container's output into a sink.
pub struct LogWorker {
    container_id: String,
    follow: bool,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LogWorker {
    pub fn spawn(
        client: Arc<dyn DockerApi>,
        container_id: String,
        follow: bool,
        sink: LogSink,
        settings: Arc<Settings>,
        refresh: mpsc::WeakSender<Command>,
    ) -> Self {
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let task = LogTask {
            client,
            container_id: container_id.clone(),
            options: LogOptions {
                follow,
                timestamps: settings.log_timestamps,
                since: 0,
            },
            settings,
            token: token.clone(),
        };
        let done = Arc::clone(&finished);
        let handle = tokio::spawn(async move {
            task.run(sink, refresh, done).await;
        });
        Self {
            container_id,
            follow,
            token,
            finished,
            handle,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn follows(&self) -> bool {
        self.follow
    }

    /// Asks the worker to stop at its next poll boundary.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LoggingStatus {
        if self.is_finished() {
            LoggingStatus::Complete
        } else {
            LoggingStatus::Active
        }
    }

    /// Waits for the task to end. Meant for shutdown and tests.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("Log worker for {} panicked: {}", self.container_id, e);
        }
    }
}

struct LogTask {
    client: Arc<dyn DockerApi>,
    container_id: String,
    options: LogOptions,
    settings: Arc<Settings>,
    token: CancellationToken,
}

impl LogTask {
    async fn run(
        self,
        mut sink: LogSink,
        refresh: mpsc::WeakSender<Command>,
        finished: Arc<AtomicBool>,
    ) {
        match self.pump(&mut sink).await {
            Ok(Outcome::Completed) => debug!("Log stream of {} completed", self.container_id),
            Ok(Outcome::Stopped) => info!("Stopped logging container {}", self.container_id),
            Err(err) => error!("Logging container {} aborted: {}", self.container_id, err),
        }

        // the container may have exited in the meantime
        if let Some(commands) = refresh.upgrade() {
            let _ = commands
                .send(Command::Containers {
                    force: true,
                    reply: None,
                })
                .await;
        }
        if let Err(e) = sink.shutdown().await {
            debug!("Closing log sink of {} failed: {}", self.container_id, e);
        }
        finished.store(true, Ordering::Release);
    }

    async fn sleep(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn pump(&self, sink: &mut LogSink) -> Result<Outcome> {
        if !self.sleep(self.settings.log_initial_delay()).await {
            return Ok(Outcome::Stopped);
        }

        let mut options = self.options;
        let mut attempts = 0;
        'reopen: loop {
            let mut stream = self.client.logs(&self.container_id, options);
            loop {
                let first = tokio::select! {
                    _ = self.token.cancelled() => return Ok(Outcome::Stopped),
                    item = stream.next() => item,
                };
                let mut batch = match first {
                    Some(item) => vec![item],
                    None => return Ok(Outcome::Completed),
                };
                let mut ended = false;
                loop {
                    match stream.next().now_or_never() {
                        Some(Some(item)) => batch.push(item),
                        Some(None) => {
                            ended = true;
                            break;
                        }
                        None => break,
                    }
                }

                for item in batch {
                    match item {
                        Ok(chunk) => sink.write_all(payload(&chunk)).await?,
                        Err(err) if err.is_timeout() => {
                            attempts += 1;
                            if attempts > self.settings.log_retry_limit {
                                return Err(DockerError::RetriesExhausted {
                                    id: self.container_id.clone(),
                                    attempts: attempts - 1,
                                });
                            }
                            warn!(
                                "Log stream of {} timed out, reopening ({}/{})",
                                self.container_id, attempts, self.settings.log_retry_limit
                            );
                            sink.flush().await?;
                            // skip what was already written
                            options.since = Utc::now().timestamp();
                            continue 'reopen;
                        }
                        Err(err) => return Err(err),
                    }
                }
                sink.flush().await?;

                if ended {
                    return Ok(Outcome::Completed);
                }
                if !self.sleep(self.settings.log_poll_delay()).await {
                    return Ok(Outcome::Stopped);
                }
            }
        }
    }
}

/// Log workers of one connection, keyed by logging id.
#[derive(Default)]
pub struct LogWorkers {
    workers: HashMap<String, LogWorker>,
}

impl LogWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the worker built by `spawn` unless a live one already exists
    /// for `key`, in which case the sink is closed unused and `false` returned.
    pub fn start<F>(&mut self, key: String, sink: LogSink, spawn: F) -> bool
    where
        F: FnOnce(LogSink) -> LogWorker,
    {
        if let Some(existing) = self.workers.get(&key) {
            if !existing.is_finished() {
                debug!("Container {} is already being logged", key);
                let mut sink = sink;
                tokio::spawn(async move {
                    let _ = sink.shutdown().await;
                });
                return false;
            }
        }
        self.workers.insert(key, spawn(sink));
        true
    }

    pub fn stop(&mut self, key: &str, remove: bool) {
        let worker = if remove {
            self.workers.remove(key)
        } else {
            None
        };
        match worker.as_ref().or_else(|| self.workers.get(key)) {
            Some(w) => w.request_stop(),
            None => debug!("No log worker for {}", key),
        }
    }

    pub fn status(&self, key: &str) -> LoggingStatus {
        self.workers
            .get(key)
            .map(LogWorker::status)
            .unwrap_or(LoggingStatus::None)
    }

    /// Drops workers of containers that have exited. Followers are stopped;
    /// one-shot readers are left to drain what the daemon still sends.
    pub fn forget_exited(&mut self, exited: &[String]) {
        for id in exited {
            let keys: Vec<String> = self
                .workers
                .iter()
                .filter(|(_, w)| w.container_id() == id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                let forget = match self.workers.get(&key) {
                    Some(w) if w.follows() => {
                        w.request_stop();
                        true
                    }
                    Some(w) => w.is_finished(),
                    None => false,
                };
                if forget {
                    self.workers.remove(&key);
                }
            }
        }
    }

    pub fn stop_all(&mut self) {
        for (_, worker) in self.workers.drain() {
            worker.request_stop();
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn payload_ignores_the_stream_kind() {
        let out = LogOutput::StdOut {
            message: Bytes::from_static(b"out"),
        };
        let err = LogOutput::StdErr {
            message: Bytes::from_static(b"err"),
        };
        assert_eq!(payload(&out), b"out");
        assert_eq!(payload(&err), b"err");
    }

    #[test]
    fn unknown_ids_have_no_status() {
        let workers = LogWorkers::new();
        assert_eq!(workers.status("nope"), LoggingStatus::None);
        assert!(workers.is_empty());
    }
}
