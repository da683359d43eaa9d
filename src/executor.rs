//! Lifecycle of a single executor instance.
//!
//! An executor owns one endpoint (and its port), one container and one
//! network attachment. It moves through
//! `Created → Starting → Running → Stopping → Stopped`; a failed start or
//! stop leaves it `Failed`. The container address and the started endpoint
//! only exist in the `Running` state.

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn, Level};

use crate::{
    container::ContainerConfiguration,
    context::RuntimeContext,
    endpoint::{bind_free_port, ExecutorEndpoint, InvocationPayload, ServiceEndpoint},
    error::{self, ExecutorError},
    function_version::FunctionVersion,
    naming::{RAPID_ENTRYPOINT, TASK_DIR},
    utils::truncate,
    version_preparer::PreparedVersion,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorStatus::Created => "created",
            ExecutorStatus::Starting => "starting",
            ExecutorStatus::Running => "running",
            ExecutorStatus::Stopping => "stopping",
            ExecutorStatus::Stopped => "stopped",
            ExecutorStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct RunningExecutor {
    endpoint: Box<dyn ExecutorEndpoint>,
    address: Ipv4Addr,
    network: String,
}

enum LifecycleState {
    Created { endpoint: Box<dyn ExecutorEndpoint> },
    Starting,
    Running(RunningExecutor),
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    fn status(&self) -> ExecutorStatus {
        match self {
            LifecycleState::Created { .. } => ExecutorStatus::Created,
            LifecycleState::Starting => ExecutorStatus::Starting,
            LifecycleState::Running(_) => ExecutorStatus::Running,
            LifecycleState::Stopping => ExecutorStatus::Stopping,
            LifecycleState::Stopped => ExecutorStatus::Stopped,
            LifecycleState::Failed => ExecutorStatus::Failed,
        }
    }
}

/// Runs one function version inside a container.
pub struct DockerRuntimeExecutor {
    id: String,
    prepared: Arc<PreparedVersion>,
    ctx: RuntimeContext,
    port: u16,
    state: LifecycleState,
}

impl DockerRuntimeExecutor {
    /// Reserve a port and build the (not yet started) endpoint forwarding
    /// container callbacks to `service`.
    pub fn new(
        id: impl Into<String>,
        prepared: Arc<PreparedVersion>,
        service: Arc<dyn ServiceEndpoint>,
        ctx: RuntimeContext,
    ) -> error::Result<Self> {
        let id = id.into();
        debug!(
            function = %prepared.version.qualified_arn(),
            executor_id = %id,
            "Creating executor endpoint"
        );
        let endpoint = build_endpoint(&ctx, service).map_err(|source| {
            ExecutorError::StartFailed {
                executor_id: id.clone(),
                function: prepared.version.qualified_arn(),
                source,
            }
        })?;
        let port = endpoint.port();
        debug!(
            function = %prepared.version.qualified_arn(),
            executor_id = %id,
            port,
            "Finished creating executor endpoint"
        );
        Ok(Self {
            id,
            prepared,
            ctx,
            port,
            state: LifecycleState::Created { endpoint },
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function_version(&self) -> &FunctionVersion {
        &self.prepared.version
    }

    pub fn state(&self) -> ExecutorStatus {
        self.state.status()
    }

    /// Local port of this executor's endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host under which the container reaches the service.
    pub fn endpoint_from_executor(&self) -> &str {
        &self.ctx.config.callback_host
    }

    /// URL of this executor's endpoint as seen from inside its container.
    pub fn runtime_endpoint(&self) -> String {
        format!("http://{}:{}", self.endpoint_from_executor(), self.port)
    }

    /// Image this executor's container is created from.
    pub fn image(&self) -> &str {
        self.prepared.image()
    }

    /// Address of the running container.
    pub fn address(&self) -> error::Result<Ipv4Addr> {
        match &self.state {
            LifecycleState::Running(running) => Ok(running.address),
            _ => Err(self.not_ready()),
        }
    }

    /// Network the running container is attached to.
    pub fn network(&self) -> error::Result<&str> {
        match &self.state {
            LifecycleState::Running(running) => Ok(&running.network),
            _ => Err(self.not_ready()),
        }
    }

    /// Start the endpoint and the container and wire them to each other.
    ///
    /// On failure everything acquired so far is released again (the
    /// container is force-removed, the endpoint shut down) and the executor
    /// is left `Failed`.
    pub async fn start(&mut self, env_vars: BTreeMap<String, String>) -> error::Result<()> {
        let mut endpoint = match std::mem::replace(&mut self.state, LifecycleState::Starting) {
            LifecycleState::Created { endpoint } => endpoint,
            other => {
                let state = other.status();
                self.state = other;
                return Err(ExecutorError::InvalidState {
                    executor_id: self.id.clone(),
                    state,
                });
            }
        };

        let mut container_created = false;
        match self
            .launch(endpoint.as_mut(), env_vars, &mut container_created)
            .await
        {
            Ok((network, address)) => {
                endpoint.set_container_address(address);
                info!(
                    function = %self.prepared.version.qualified_arn(),
                    executor_id = %self.id,
                    container_ip = %address,
                    network = %network,
                    port = self.port,
                    "Executor started"
                );
                self.state = LifecycleState::Running(RunningExecutor {
                    endpoint,
                    address,
                    network,
                });
                Ok(())
            }
            Err(source) => {
                warn!(
                    function = %self.prepared.version.qualified_arn(),
                    executor_id = %self.id,
                    error = %format!("{source:#}"),
                    "Executor failed to start, releasing its resources"
                );
                self.release_after_failed_start(endpoint, container_created)
                    .await;
                self.state = LifecycleState::Failed;
                Err(ExecutorError::StartFailed {
                    executor_id: self.id.clone(),
                    function: self.prepared.version.qualified_arn(),
                    source,
                })
            }
        }
    }

    async fn launch(
        &self,
        endpoint: &mut dyn ExecutorEndpoint,
        env_vars: BTreeMap<String, String>,
        container_created: &mut bool,
    ) -> Result<(String, Ipv4Addr)> {
        endpoint.start().await?;

        let network = self
            .ctx
            .network_provisioner
            .network_for_executor(&self.id)
            .await
            .context("Failed to resolve executor network")?;

        let container_config = ContainerConfiguration {
            image_name: self.prepared.image().to_string(),
            name: self.id.clone(),
            env_vars,
            network: network.clone(),
            entrypoint: RAPID_ENTRYPOINT.to_string(),
        };

        let client = &self.ctx.container_client;
        client.create_container(&container_config).await?;
        *container_created = true;

        if self.prepared.prebuilt_image.is_none() {
            client
                .copy_into_container(&self.id, &self.ctx.config.init_binary_path, RAPID_ENTRYPOINT)
                .await?;
            client
                .copy_into_container(&self.id, &self.prepared.code_path, TASK_DIR)
                .await?;
        }

        client.start_container(&self.id).await?;

        let address = client
            .container_ipv4_for_network(&self.id, &network)
            .await?;
        Ok((network, address))
    }

    async fn release_after_failed_start(
        &self,
        mut endpoint: Box<dyn ExecutorEndpoint>,
        container_created: bool,
    ) {
        if container_created {
            if let Err(e) = self
                .ctx
                .container_client
                .remove_container(&self.id, true)
                .await
            {
                warn!(
                    executor_id = %self.id,
                    error = %format!("{e:#}"),
                    "Could not remove container of failed executor"
                );
            }
        }
        self.shutdown_endpoint(endpoint.as_mut()).await;
    }

    /// Relay an invocation into the running container.
    pub async fn invoke(&self, payload: &InvocationPayload) -> error::Result<()> {
        let LifecycleState::Running(running) = &self.state else {
            return Err(self.not_ready());
        };
        if tracing::enabled!(Level::DEBUG) {
            let rendered = serde_json::to_string(payload).unwrap_or_default();
            debug!(
                executor_id = %self.id,
                payload = %truncate(&rendered, self.ctx.config.log_truncate_length),
                "Sending invoke-payload to executor"
            );
        }
        running
            .endpoint
            .invoke(payload)
            .await
            .map_err(|source| ExecutorError::InvokeFailed {
                executor_id: self.id.clone(),
                source,
            })
    }

    /// Stop and remove the container, then shut the endpoint down.
    ///
    /// The endpoint is shut down on every path; its own errors are logged
    /// and never returned. Stopping an executor that is already stopped or
    /// failed does nothing.
    pub async fn stop(&mut self) -> error::Result<()> {
        match std::mem::replace(&mut self.state, LifecycleState::Stopping) {
            LifecycleState::Running(mut running) => {
                let removed = self.stop_container().await;
                self.shutdown_endpoint(running.endpoint.as_mut()).await;
                match removed {
                    Ok(()) => {
                        info!(executor_id = %self.id, "Executor stopped");
                        self.state = LifecycleState::Stopped;
                        Ok(())
                    }
                    Err(source) => {
                        self.state = LifecycleState::Failed;
                        Err(ExecutorError::StopFailed {
                            executor_id: self.id.clone(),
                            source,
                        })
                    }
                }
            }
            LifecycleState::Created { mut endpoint } => {
                self.shutdown_endpoint(endpoint.as_mut()).await;
                self.state = LifecycleState::Stopped;
                Ok(())
            }
            other @ (LifecycleState::Stopped | LifecycleState::Failed) => {
                debug!(
                    executor_id = %self.id,
                    state = %other.status(),
                    "Executor already stopped"
                );
                self.state = other;
                Ok(())
            }
            other => {
                let state = other.status();
                self.state = other;
                Err(ExecutorError::InvalidState {
                    executor_id: self.id.clone(),
                    state,
                })
            }
        }
    }

    async fn stop_container(&self) -> Result<()> {
        let client = &self.ctx.container_client;
        let stopped = client
            .stop_container(&self.id, self.ctx.config.container_stop_timeout())
            .await;
        // A container that failed to stop is killed by the forced removal.
        client.remove_container(&self.id, stopped.is_err()).await?;
        if let Err(e) = stopped {
            warn!(
                executor_id = %self.id,
                error = %format!("{e:#}"),
                "Container did not stop gracefully, removed it forcefully"
            );
        }
        Ok(())
    }

    async fn shutdown_endpoint(&self, endpoint: &mut dyn ExecutorEndpoint) {
        if let Err(e) = endpoint.shutdown().await {
            debug!(
                function = %self.prepared.version.qualified_arn(),
                executor_id = %self.id,
                error = %format!("{e:#}"),
                "Error while stopping executor endpoint"
            );
        }
    }

    fn not_ready(&self) -> ExecutorError {
        ExecutorError::NotReady {
            executor_id: self.id.clone(),
        }
    }
}

impl Drop for DockerRuntimeExecutor {
    fn drop(&mut self) {
        if let LifecycleState::Running(_) = self.state {
            warn!(
                executor_id = %self.id,
                "Executor dropped while running, its container is left behind"
            );
        }
    }
}

fn build_endpoint(
    ctx: &RuntimeContext,
    service: Arc<dyn ServiceEndpoint>,
) -> Result<Box<dyn ExecutorEndpoint>> {
    let bind_addr: IpAddr = ctx
        .config
        .endpoint_bind_addr
        .parse()
        .with_context(|| {
            format!("Invalid endpoint bind address {}", ctx.config.endpoint_bind_addr)
        })?;
    let listener = bind_free_port(bind_addr)?;
    ctx.endpoint_factory.create(listener, service)
}
