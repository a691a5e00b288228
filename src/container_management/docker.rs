use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    BuildImageOptions, CommitContainerOptions, CreateImageOptions, ListImagesOptions, PushImageOptions, RemoveImageOptions,
    SearchImagesOptions, TagImageOptions,
};
use bollard::models::{ContainerConfig, ContainerInspectResponse, ContainerSummary, ImageInspect, ImageSummary};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::StreamExt;
use log::debug;

use super::client::{
    AttachStreams, ClientFactory, CommitOptions, DockerApi, LogChunks, LogOptions, ProgressMessage,
    ProgressStream,
};
use super::{ConnectionInfo, ImageSearchResult};
use crate::connection::Transport;
use crate::error::{DockerError, Result};

/// `DockerApi` over the bollard HTTP client.
#[derive(Clone)]
pub struct BollardClient {
    docker: Docker,
}

impl BollardClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect(transport: &Transport, timeout_secs: u64) -> Result<Self> {
        let docker = match transport {
            Transport::UnixSocket { path } => {
                Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)
            }
            Transport::Tcp {
                host,
                cert_path: Some(certs),
            } => Docker::connect_with_ssl(
                host,
                &certs.join("key.pem"),
                &certs.join("cert.pem"),
                &certs.join("ca.pem"),
                timeout_secs,
                API_DEFAULT_VERSION,
            ),
            Transport::Tcp {
                host,
                cert_path: None,
            } => Docker::connect_with_http(host, timeout_secs, API_DEFAULT_VERSION),
        }
        .map_err(map_error)?;
        Ok(Self { docker })
    }

    pub fn inner(&self) -> &Docker {
        &self.docker
    }
}

impl std::fmt::Debug for BollardClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BollardClient").finish()
    }
}

pub struct BollardClientFactory {
    timeout_secs: u64,
}

impl BollardClientFactory {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl ClientFactory for BollardClientFactory {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn DockerApi>> {
        let client = BollardClient::connect(transport, self.timeout_secs)?;
        Ok(Arc::new(client))
    }
}

#[async_trait]
impl DockerApi for BollardClient {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DockerError::Ping(e.to_string()))
    }

    async fn info(&self) -> Result<ConnectionInfo> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| DockerError::Info(e.to_string()))?;
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| DockerError::Info(e.to_string()))?;
        Ok(ConnectionInfo {
            containers: info.containers.unwrap_or(0),
            images: info.images.unwrap_or(0),
            driver: info.driver,
            kernel_version: info.kernel_version,
            operating_system: info.operating_system,
            cpus: info.ncpu.unwrap_or(0),
            total_memory: info.mem_total.unwrap_or(0),
            server_version: version.version,
            api_version: version.api_version,
            go_version: version.go_version,
            os: version.os,
            arch: version.arch,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(map_error)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn create_container(&self, config: Config<String>, name: Option<&str>) -> Result<String> {
        // the daemon picks a random name when none is given
        let options = name
            .filter(|n| !n.is_empty())
            .map(|n| CreateContainerOptions {
                name: n.to_string(),
                ..Default::default()
            });
        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(map_error)?;
        for warning in &created.warnings {
            debug!("Create container warning: {}", warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| container_error(id, e))
    }

    async fn commit_container(&self, options: CommitOptions, config: ContainerConfig) -> Result<String> {
        let container = options.container.clone();
        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: options.container,
                    repo: options.repo,
                    tag: options.tag.unwrap_or_default(),
                    comment: options.comment.unwrap_or_default(),
                    author: options.author.unwrap_or_default(),
                    pause: true,
                    changes: None,
                },
                Config::from(config),
            )
            .await
            .map_err(|e| container_error(&container, e))?;
        Ok(commit.id.unwrap_or_default())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut code = 0;
        while let Some(item) = stream.next().await {
            match item {
                // bollard 0.13 reports non-zero exit codes through `status_code`
                Ok(response) => code = response.status_code,
                Err(e) => return Err(container_error(id, e)),
            }
        }
        Ok(code)
    }

    fn logs(&self, id: &str, options: LogOptions) -> LogChunks {
        let id = id.to_string();
        self.docker
            .logs(
                &id,
                Some(LogsOptions::<String> {
                    follow: options.follow,
                    stdout: true,
                    stderr: true,
                    since: options.since,
                    timestamps: options.timestamps,
                    tail: String::from("all"),
                    ..Default::default()
                }),
            )
            .map(move |item| item.map_err(|e| container_error(&id, e)))
            .boxed()
    }

    async fn attach_container(&self, id: &str) -> Result<AttachStreams> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(|e| container_error(id, e))?;
        let id = id.to_string();
        Ok(AttachStreams {
            output: results
                .output
                .map(move |item| item.map_err(|e| container_error(&id, e)))
                .boxed(),
            input: results.input,
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(map_error)
    }

    async fn inspect_image(&self, id: &str) -> Result<ImageInspect> {
        self.docker.inspect_image(id).await.map_err(map_error)
    }

    async fn search_images(&self, term: &str) -> Result<Vec<ImageSearchResult>> {
        let results = self
            .docker
            .search_images(SearchImagesOptions::<String> {
                term: term.to_string(),
                ..Default::default()
            })
            .await
            .map_err(map_error)?;
        Ok(results
            .into_iter()
            .map(|r| ImageSearchResult {
                name: r.name.unwrap_or_default(),
                description: r.description.unwrap_or_default(),
                official: r.is_official.unwrap_or(false),
                automated: r.is_automated.unwrap_or(false),
                stars: r.star_count.unwrap_or(0),
            })
            .collect())
    }

    fn pull_image(&self, image: &str) -> ProgressStream {
        let (repo, tag) = split_reference(image);
        self.docker
            .create_image(
                Some(CreateImageOptions::<String> {
                    from_image: repo,
                    tag,
                    ..Default::default()
                }),
                None,
                None,
            )
            .map(|item| item.map(ProgressMessage::from).map_err(map_error))
            .boxed()
    }

    fn push_image(&self, image: &str) -> ProgressStream {
        let (repo, tag) = split_reference(image);
        self.docker
            .push_image(&repo, Some(PushImageOptions::<String> { tag }), None)
            .map(|item| item.map(ProgressMessage::from).map_err(map_error))
            .boxed()
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        self.docker
            .tag_image(
                image,
                Some(TagImageOptions::<String> {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await
            .map_err(map_error)
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force,
                    noprune: false,
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    fn build_image(&self, context: Vec<u8>, name: Option<&str>) -> ProgressStream {
        let options = BuildImageOptions::<String> {
            dockerfile: String::from("Dockerfile"),
            t: name.unwrap_or_default().to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        self.docker
            .build_image(options, None, Some(hyper::Body::from(context)))
            .map(|item| item.map(ProgressMessage::from).map_err(map_error))
            .boxed()
    }
}

/// Splits `repo[:tag]`, leaving registry ports alone. The tag defaults to `latest`.
fn split_reference(reference: &str) -> (String, String) {
    match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => (
            reference[..idx].to_string(),
            reference[idx + 1..].to_string(),
        ),
        _ => (reference.to_string(), String::from("latest")),
    }
}

fn is_timeout(err: &BollardError) -> bool {
    match err {
        BollardError::RequestTimeoutError => true,
        BollardError::IOError { err } => err.kind() == std::io::ErrorKind::TimedOut,
        _ => false,
    }
}

fn map_error(err: BollardError) -> DockerError {
    if is_timeout(&err) {
        return DockerError::Timeout;
    }
    let message = match &err {
        BollardError::DockerResponseServerError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    DockerError::Daemon {
        message,
        source: Some(err),
    }
}

fn container_error(id: &str, err: BollardError) -> DockerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DockerError::ContainerNotFound(id.to_string()),
        other => map_error(other),
    }
}
