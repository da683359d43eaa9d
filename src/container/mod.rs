mod docker;

use std::{collections::BTreeMap, net::Ipv4Addr, path::Path, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerClient;

/// Everything the container runtime needs to create an executor container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfiguration {
    /// Image reference the container is created from.
    pub image_name: String,
    /// Container name, equal to the executor id.
    pub name: String,
    pub env_vars: BTreeMap<String, String>,
    /// Network the container is attached to.
    pub network: String,
    pub entrypoint: String,
}

/// Container runtime primitives used to prepare versions and run executors.
///
/// Every call blocks until the runtime has completed the operation.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Build an image tagged `image_name` from a context directory holding a
    /// `Dockerfile`.
    async fn build_image(&self, context_dir: &Path, image_name: &str) -> Result<()>;

    async fn pull_image(&self, image_name: &str) -> Result<()>;

    /// Names (`repository:tag`) of all locally cached images.
    async fn list_image_names(&self) -> Result<Vec<String>>;

    async fn remove_image(&self, image_name: &str) -> Result<()>;

    /// Create a container, returning its id.
    async fn create_container(&self, config: &ContainerConfiguration) -> Result<String>;

    async fn start_container(&self, container_name: &str) -> Result<()>;

    /// Stop a container, killing it once `timeout` has passed.
    async fn stop_container(&self, container_name: &str, timeout: Duration) -> Result<()>;

    /// Remove a container. A running container is killed first when `force`
    /// is set.
    async fn remove_container(&self, container_name: &str, force: bool) -> Result<()>;

    /// Copy a host file to `container_path`, or the contents of a host
    /// directory into the `container_path` directory.
    async fn copy_into_container(
        &self,
        container_name: &str,
        local_path: &Path,
        container_path: &str,
    ) -> Result<()>;

    async fn container_ipv4_for_network(
        &self,
        container_name: &str,
        network: &str,
    ) -> Result<Ipv4Addr>;
}
