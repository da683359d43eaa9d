use std::{
    io::Write,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    body_full,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        BuildImageOptionsBuilder,
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        ListImagesOptions,
        RemoveContainerOptions,
        RemoveImageOptions,
        StartContainerOptions,
        StopContainerOptions,
        UploadToContainerOptions,
    },
    Docker,
};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, error, info};

use super::{ContainerClient, ContainerConfiguration};

/// [`ContainerClient`] talking to a Docker daemon.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect to the default Docker socket.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn with_address(address: &str) -> Result<Self> {
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        };
        Ok(Self { docker })
    }

    pub fn from_address(address: Option<&str>) -> Result<Self> {
        match address {
            Some(address) => Self::with_address(address),
            None => Self::new(),
        }
    }
}

/// Tar `local_path` so that extracting the archive at `/` places it at
/// `container_path`.
fn tar_for_copy(local_path: &Path, container_path: &str) -> Result<Vec<u8>> {
    let target = container_path.trim_start_matches('/');
    let target = if target.is_empty() { "." } else { target };
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    if local_path.is_dir() {
        builder.append_dir_all(target, local_path)?;
    } else {
        builder.append_path_with_name(local_path, target)?;
    }
    Ok(builder.into_inner()?)
}

/// Gzipped tar of a build context directory.
fn build_context(context_dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", context_dir)?;
    let uncompressed = builder.into_inner()?;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}

async fn blocking_tar<F>(what: String, f: F) -> Result<Bytes>
where
    F: FnOnce() -> Result<Vec<u8>> + Send + 'static,
{
    let bytes = tokio::task::spawn_blocking(f)
        .await
        .context("tar task panicked")?
        .with_context(|| format!("Failed to archive {what}"))?;
    Ok(Bytes::from(bytes))
}

/// Docker takes the grace period as whole seconds in an `i32`.
fn stop_timeout_secs(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerClient for DockerClient {
    async fn build_image(&self, context_dir: &Path, image_name: &str) -> Result<()> {
        let dir: PathBuf = context_dir.to_path_buf();
        let context =
            blocking_tar(dir.display().to_string(), move || build_context(&dir)).await?;

        info!(image = %image_name, event = "image_build_started", "Building image");
        let start = Instant::now();

        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(image_name)
            .rm(true)
            .build();
        let mut stream = self
            .docker
            .build_image(options, None, Some(body_full(context)));

        while let Some(result) = stream.next().await {
            let build_info = result.with_context(|| format!("Failed to build image {image_name}"))?;
            if let Some(error) = build_info.error {
                anyhow::bail!("Failed to build image {image_name}: {error}");
            }
            if let Some(line) = build_info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %image_name, "{}", line);
                }
            }
        }

        info!(
            image = %image_name,
            duration_ms = %start.elapsed().as_millis(),
            event = "image_build_completed",
            "Image built"
        );
        Ok(())
    }

    async fn pull_image(&self, image_name: &str) -> Result<()> {
        info!(image = %image_name, event = "image_pull_started", "Pulling Docker image");
        let start = Instant::now();

        let options = CreateImageOptions {
            from_image: Some(image_name.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image_name, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    error!(
                        image = %image_name,
                        duration_ms = %start.elapsed().as_millis(),
                        error = %e,
                        event = "image_pull_failed",
                        "Failed to pull Docker image"
                    );
                    return Err(e).context(format!("Failed to pull image {}", image_name));
                }
            }
        }

        info!(
            image = %image_name,
            duration_ms = %start.elapsed().as_millis(),
            event = "image_pull_completed",
            "Docker image pull completed"
        );
        Ok(())
    }

    async fn list_image_names(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::default()))
            .await
            .context("Failed to list images")?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .filter(|tag| tag != "<none>:<none>")
            .collect())
    }

    async fn remove_image(&self, image_name: &str) -> Result<()> {
        self.docker
            .remove_image(image_name, None::<RemoveImageOptions>, None)
            .await
            .with_context(|| format!("Failed to remove image {image_name}"))?;
        info!(image = %image_name, "Image removed");
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfiguration) -> Result<String> {
        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            network_mode: Some(config.network.clone()),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(config.image_name.clone()),
            entrypoint: Some(vec![config.entrypoint.clone()]),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(config.name.clone()),
            platform: String::new(),
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", config.name))?;

        info!(
            container = %config.name,
            container_id = %response.id,
            image = %config.image_name,
            network = %config.network,
            "Container created"
        );
        Ok(response.id)
    }

    async fn start_container(&self, container_name: &str) -> Result<()> {
        self.docker
            .start_container(container_name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {container_name}"))
    }

    async fn stop_container(&self, container_name: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(stop_timeout_secs(timeout)),
            signal: None,
        };
        match self
            .docker
            .stop_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to stop container {container_name}")),
        }
    }

    async fn remove_container(&self, container_name: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                container_name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {container_name}"))
    }

    async fn copy_into_container(
        &self,
        container_name: &str,
        local_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        let source = local_path.to_path_buf();
        let target = container_path.to_string();
        let archive = blocking_tar(source.display().to_string(), move || {
            tar_for_copy(&source, &target)
        })
        .await?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_name, Some(options), body_full(archive))
            .await
            .with_context(|| {
                format!(
                    "Failed to copy {} into container {} at {}",
                    local_path.display(),
                    container_name,
                    container_path
                )
            })
    }

    async fn container_ipv4_for_network(
        &self,
        container_name: &str,
        network: &str,
    ) -> Result<Ipv4Addr> {
        let inspect = match self
            .docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => {
                anyhow::bail!("Container {} does not exist", container_name)
            }
            Err(e) => return Err(e).context("Failed to inspect container"),
        };

        let networks = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .context("Container has no network settings")?;

        let endpoint = networks.get(network).with_context(|| {
            format!("Container {} is not attached to network {}", container_name, network)
        })?;

        let ip = endpoint
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .with_context(|| {
                format!("Container {} has no IP address on {}", container_name, network)
            })?;

        ip.parse::<Ipv4Addr>()
            .with_context(|| format!("Invalid IPv4 address for {container_name}: {ip}"))
    }
}
