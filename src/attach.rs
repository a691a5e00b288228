use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bollard::container::LogOutput;
use futures::StreamExt;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::container_management::{ContainerInfo, DockerApi, LogChunks};
use crate::error::Result;
use crate::log_worker::payload;
use crate::settings::Settings;

const FRAME_HEADER_LEN: usize = 8;
const ECHO_CAPACITY: usize = 1024;
const READ_BUFFER_LEN: usize = 1024;

lazy_static! {
    // window title, colour/erase attributes, cursor visibility
    static ref TERMINAL_CODES: Regex = Regex::new(
        r"(?-u)\x1B\]0;[^\x07]*\x07|\x1B\[(?:[0-9]{1,2}(?:;[0-9]{1,2})?)?[mK]|\x1B\[\?[0-9]{1,4}h"
    )
    .expect("terminal code pattern");
}

/// Removes the escape sequences a plain console cannot render.
pub fn strip_terminal_codes(bytes: &[u8]) -> Vec<u8> {
    TERMINAL_CODES.replace_all(bytes, &b""[..]).into_owned()
}

/// Last chunk written to a tty, used to drop the daemon's echo of it.
#[derive(Debug, Default)]
pub struct EchoBuffer {
    last_input: Vec<u8>,
}

fn is_newline(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

impl EchoBuffer {
    pub fn record(&mut self, input: &[u8]) {
        let len = input.len().min(ECHO_CAPACITY);
        self.last_input = input[..len].to_vec();
    }

    /// Number of leading bytes of `output` that echo the recorded input,
    /// including the line terminator that follows the echo.
    ///
    /// CR and LF are interchangeable and NUL input bytes are ignored. Any
    /// other difference means there is no echo.
    pub fn strip_echo(&mut self, output: &[u8]) -> usize {
        let mut matched = 0;
        for (i, &sent) in self.last_input.iter().enumerate() {
            if sent == 0 {
                continue;
            }
            let received = output.get(i).copied().unwrap_or(0);
            if sent == received || is_newline(sent) || is_newline(received) {
                matched += 1;
            } else {
                return 0;
            }
        }
        if matched == 0 {
            return 0;
        }
        self.last_input.clear();
        (matched + 1).min(output.len())
    }
}

/// Removes the 8-byte stdout/stderr multiplexing headers of a non-tty stream.
///
/// Headers and payloads may be split across chunks. Input that does not start
/// with a valid header is passed through untouched from then on.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Vec<u8>,
    remaining: usize,
    raw: bool,
}

impl FrameDecoder {
    pub fn decode(&mut self, mut input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        while !input.is_empty() {
            if self.raw {
                out.extend_from_slice(input);
                break;
            }
            if self.remaining > 0 {
                let n = self.remaining.min(input.len());
                out.extend_from_slice(&input[..n]);
                self.remaining -= n;
                input = &input[n..];
                continue;
            }
            let n = (FRAME_HEADER_LEN - self.header.len()).min(input.len());
            self.header.extend_from_slice(&input[..n]);
            input = &input[n..];
            if self.header.len() < FRAME_HEADER_LEN {
                break;
            }
            if self.header[0] <= 2 && self.header[1..4] == [0, 0, 0] {
                let len = [self.header[4], self.header[5], self.header[6], self.header[7]];
                self.remaining = u32::from_be_bytes(len) as usize;
                self.header.clear();
            } else {
                self.raw = true;
                out.append(&mut self.header);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    /// How many times the output pump reattaches after a timeout.
    pub reattach_limit: u32,
    /// Non-tty output is normally collected by a log worker.
    pub pump_output_without_tty: bool,
}

impl AttachOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reattach_limit: settings.attach_reattach_limit,
            pump_output_without_tty: false,
        }
    }
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// The running pumps of an attached console.
pub struct AttachSession {
    token: CancellationToken,
    input: JoinHandle<()>,
    output: Option<JoinHandle<()>>,
    tty: bool,
}

impl AttachSession {
    pub fn tty(&self) -> bool {
        self.tty
    }

    pub fn has_output_pump(&self) -> bool {
        self.output.is_some()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token that cancels the session, for use after the session was moved.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for both pumps to end.
    pub async fn join(self) {
        if let Err(e) = self.input.await {
            warn!("Attach input pump panicked: {}", e);
        }
        if let Some(output) = self.output {
            if let Err(e) = output.await {
                warn!("Attach output pump panicked: {}", e);
            }
        }
    }
}

fn lock(echo: &Mutex<EchoBuffer>) -> MutexGuard<'_, EchoBuffer> {
    match echo.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn is_running(client: &dyn DockerApi, id: &str) -> bool {
    match client.inspect_container(id).await {
        Ok(raw) => ContainerInfo::new(raw).running(),
        Err(e) => {
            debug!("Inspecting {} during attach failed: {}", id, e);
            false
        }
    }
}

/// Connects `input` to the container's stdin and its output to `output`.
pub async fn attach<R, W>(
    client: Arc<dyn DockerApi>,
    container_id: &str,
    input: R,
    output: W,
    options: AttachOptions,
) -> Result<AttachSession>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let info = ContainerInfo::new(client.inspect_container(container_id).await?);
    let tty = info.tty();
    let streams = client.attach_container(container_id).await?;
    info!("Attached to container {} (tty: {})", container_id, tty);

    let token = CancellationToken::new();
    let echo = Arc::new(Mutex::new(EchoBuffer::default()));

    let input_pump = InputPump {
        client: Arc::clone(&client),
        container_id: container_id.to_string(),
        echo: Arc::clone(&echo),
        token: token.clone(),
    };
    let input = tokio::spawn(input_pump.run(input, streams.input));

    let output = if tty || options.pump_output_without_tty {
        let output_pump = OutputPump {
            client,
            container_id: container_id.to_string(),
            tty,
            echo,
            token: token.clone(),
            reattach_limit: options.reattach_limit,
        };
        Some(tokio::spawn(output_pump.run(streams.output, output)))
    } else {
        None
    };

    Ok(AttachSession {
        token,
        input,
        output,
        tty,
    })
}

struct InputPump {
    client: Arc<dyn DockerApi>,
    container_id: String,
    echo: Arc<Mutex<EchoBuffer>>,
    token: CancellationToken,
}

impl InputPump {
    async fn run<R>(self, mut input: R, mut stdin: Pin<Box<dyn AsyncWrite + Send>>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        loop {
            let n = tokio::select! {
                _ = self.token.cancelled() => break,
                read = input.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Reading attach input failed: {}", e);
                        break;
                    }
                },
            };
            if !is_running(self.client.as_ref(), &self.container_id).await {
                break;
            }
            if let Err(e) = stdin.write_all(&buf[..n]).await {
                debug!("Writing to {} stdin failed: {}", self.container_id, e);
                break;
            }
            lock(&self.echo).record(&buf[..n]);
            if let Err(e) = stdin.flush().await {
                debug!("Flushing {} stdin failed: {}", self.container_id, e);
                break;
            }
        }
        debug!("Attach input pump of {} ended", self.container_id);
    }
}

struct OutputPump {
    client: Arc<dyn DockerApi>,
    container_id: String,
    tty: bool,
    echo: Arc<Mutex<EchoBuffer>>,
    token: CancellationToken,
    reattach_limit: u32,
}

impl OutputPump {
    fn clean(&self, decoder: &mut FrameDecoder, chunk: &LogOutput) -> Vec<u8> {
        let bytes = payload(chunk);
        if self.tty {
            let skip = lock(&self.echo).strip_echo(bytes);
            strip_terminal_codes(&bytes[skip..])
        } else {
            match chunk {
                LogOutput::Console { .. } => decoder.decode(bytes),
                _ => bytes.to_vec(),
            }
        }
    }

    async fn run<W>(self, mut stream: LogChunks, mut output: W)
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut decoder = FrameDecoder::default();
        let mut reattached = 0;
        loop {
            let item = tokio::select! {
                _ = self.token.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                None => break,
                Some(Ok(chunk)) => {
                    let cleaned = self.clean(&mut decoder, &chunk);
                    if cleaned.is_empty() {
                        continue;
                    }
                    if let Err(e) = output.write_all(&cleaned).await {
                        debug!("Writing attach output failed: {}", e);
                        break;
                    }
                    if let Err(e) = output.flush().await {
                        debug!("Flushing attach output failed: {}", e);
                        break;
                    }
                }
                Some(Err(e)) if e.is_timeout() && reattached < self.reattach_limit => {
                    if !is_running(self.client.as_ref(), &self.container_id).await {
                        debug!("{} stopped, not reattaching", self.container_id);
                        break;
                    }
                    reattached += 1;
                    debug!("Attach output of {} timed out, reattaching", self.container_id);
                    match self.client.attach_container(&self.container_id).await {
                        Ok(streams) => {
                            stream = streams.output;
                            decoder = FrameDecoder::default();
                        }
                        Err(e) => {
                            debug!("Reattaching to {} failed: {}", self.container_id, e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!("Attach output of {} ended: {}", self.container_id, e);
                    break;
                }
            }
        }
        let _ = output.flush().await;
    }
}
