use std::sync::Arc;

use anyhow::Result;

use crate::{
    config::ExecutorConfig,
    container::{ContainerClient, DockerClient},
    endpoint::{EndpointFactory, HttpEndpointFactory},
    image_resolver::{ImageResolver, StaticImageResolver},
    network::{NetworkProvisioner, StaticNetworkProvisioner},
};

/// Capabilities shared by the version preparer and all executors.
#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<ExecutorConfig>,
    pub container_client: Arc<dyn ContainerClient>,
    pub image_resolver: Arc<dyn ImageResolver>,
    pub network_provisioner: Arc<dyn NetworkProvisioner>,
    pub endpoint_factory: Arc<dyn EndpointFactory>,
}

impl RuntimeContext {
    /// Context using `container_client` and the default collaborators
    /// derived from `config`.
    pub fn new(config: ExecutorConfig, container_client: Arc<dyn ContainerClient>) -> Result<Self> {
        let image_resolver = Arc::new(StaticImageResolver::new(config.image_prefix.clone()));
        let network_provisioner = Arc::new(StaticNetworkProvisioner::new(config.network_name()));
        let endpoint_factory = Arc::new(HttpEndpointFactory::new(config.invocation_port)?);
        Ok(Self {
            config: Arc::new(config),
            container_client,
            image_resolver,
            network_provisioner,
            endpoint_factory,
        })
    }

    /// Context backed by the Docker daemon named in `config`.
    pub fn docker(config: ExecutorConfig) -> Result<Self> {
        let client = DockerClient::from_address(config.docker.address.as_deref())?;
        Self::new(config, Arc::new(client))
    }

    pub fn with_network_provisioner(mut self, provisioner: Arc<dyn NetworkProvisioner>) -> Self {
        self.network_provisioner = provisioner;
        self
    }

    pub fn with_endpoint_factory(mut self, factory: Arc<dyn EndpointFactory>) -> Self {
        self.endpoint_factory = factory;
        self
    }
}
