//! Control-plane endpoint linking an executor's container with the service
//! that owns it.
//!
//! Each executor owns one endpoint listening on its own local port. The
//! container posts invocation results, errors, logs and status changes to it,
//! and the executor relays invocation requests into the container through
//! it.

mod http;

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
pub use http::{HttpEndpointFactory, HttpExecutorEndpoint};

/// Invocation request relayed into the container's runtime API.
pub type InvocationPayload = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub invocation_id: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationError {
    pub invocation_id: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationLogs {
    pub invocation_id: String,
    pub logs: String,
}

/// Callback surface of the service owning the executors.
#[async_trait]
pub trait ServiceEndpoint: Send + Sync {
    async fn invocation_result(&self, result: InvocationResult);
    async fn invocation_error(&self, error: InvocationError);
    async fn invocation_logs(&self, logs: InvocationLogs);
    async fn status_ready(&self, executor_id: &str);
    async fn status_error(&self, executor_id: &str, details: Bytes);
}

/// The endpoint an executor drives. Created stopped; `start` begins serving
/// container callbacks on the endpoint's port.
#[async_trait]
pub trait ExecutorEndpoint: Send + Sync {
    fn port(&self) -> u16;

    async fn start(&mut self) -> Result<()>;

    /// Address of the container invocations are relayed to.
    fn set_container_address(&mut self, address: Ipv4Addr);

    async fn invoke(&self, payload: &InvocationPayload) -> Result<()>;

    /// Stop serving and release the port.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Builds endpoints on a listener the executor has already bound.
pub trait EndpointFactory: Send + Sync {
    fn create(
        &self,
        listener: TcpListener,
        service: Arc<dyn ServiceEndpoint>,
    ) -> Result<Box<dyn ExecutorEndpoint>>;
}

/// Bind a listener on a free port of `bind_addr`.
///
/// The listener is handed over to the endpoint as is, so the port stays
/// reserved from allocation until the endpoint shuts down.
pub fn bind_free_port(bind_addr: IpAddr) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(bind_addr, 0))
        .with_context(|| format!("Failed to bind a free port on {bind_addr}"))
}
