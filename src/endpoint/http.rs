use std::{
    net::{Ipv4Addr, TcpListener},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json,
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    EndpointFactory,
    ExecutorEndpoint,
    InvocationError,
    InvocationLogs,
    InvocationPayload,
    InvocationResult,
    ServiceEndpoint,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`HttpExecutorEndpoint`]s relaying to `invocation_port` inside the
/// container.
pub struct HttpEndpointFactory {
    invocation_port: u16,
    client: reqwest::Client,
}

impl HttpEndpointFactory {
    pub fn new(invocation_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for executor endpoints")?;
        Ok(Self {
            invocation_port,
            client,
        })
    }
}

impl EndpointFactory for HttpEndpointFactory {
    fn create(
        &self,
        listener: TcpListener,
        service: Arc<dyn ServiceEndpoint>,
    ) -> Result<Box<dyn ExecutorEndpoint>> {
        let endpoint = HttpExecutorEndpoint::new(
            listener,
            service,
            self.invocation_port,
            self.client.clone(),
        )?;
        Ok(Box::new(endpoint))
    }
}

/// HTTP implementation of the executor endpoint.
///
/// Serves the container's callbacks on its own listener and posts
/// invocations to `http://<container>:<invocation_port>/invoke`.
pub struct HttpExecutorEndpoint {
    port: u16,
    listener: Option<TcpListener>,
    service: Arc<dyn ServiceEndpoint>,
    invocation_port: u16,
    container_address: Option<Ipv4Addr>,
    client: reqwest::Client,
    cancel_token: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl HttpExecutorEndpoint {
    pub fn new(
        listener: TcpListener,
        service: Arc<dyn ServiceEndpoint>,
        invocation_port: u16,
        client: reqwest::Client,
    ) -> Result<Self> {
        let port = listener
            .local_addr()
            .context("Executor endpoint listener has no local address")?
            .port();
        Ok(Self {
            port,
            listener: Some(listener),
            service,
            invocation_port,
            container_address: None,
            client,
            cancel_token: CancellationToken::new(),
            server: None,
        })
    }
}

fn router(service: Arc<dyn ServiceEndpoint>) -> Router {
    Router::new()
        .route("/invocations/{invoke_id}/response", post(invocation_response_handler))
        .route("/invocations/{invoke_id}/error", post(invocation_error_handler))
        .route("/invocations/{invoke_id}/logs", post(invocation_logs_handler))
        .route("/status/{executor_id}/ready", post(status_ready_handler))
        .route("/status/{executor_id}/error", post(status_error_handler))
        .with_state(service)
}

#[async_trait]
impl ExecutorEndpoint for HttpExecutorEndpoint {
    fn port(&self) -> u16 {
        self.port
    }

    async fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("Executor endpoint was already started")?;
        listener
            .set_nonblocking(true)
            .context("Failed to make endpoint listener non-blocking")?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .context("Failed to register endpoint listener with the runtime")?;

        let app = router(self.service.clone());
        let cancel_token = self.cancel_token.clone();
        let port = self.port;
        self.server = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel_token.cancelled().await;
                })
                .await
                .unwrap_or_else(|e| {
                    error!(port, error = %e, "Executor endpoint server error");
                });
        }));

        info!(port = self.port, "Executor endpoint listening");
        Ok(())
    }

    fn set_container_address(&mut self, address: Ipv4Addr) {
        self.container_address = Some(address);
    }

    async fn invoke(&self, payload: &InvocationPayload) -> Result<()> {
        let address = self
            .container_address
            .context("Container address is not known yet")?;
        let url = format!("http://{}:{}/invoke", address, self.invocation_port);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to send invocation to {url}"))?;
        response
            .error_for_status()
            .with_context(|| format!("Invocation rejected by {url}"))?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        // never started
        self.listener.take();
        if let Some(server) = self.server.take() {
            server
                .await
                .context("Executor endpoint server task failed")?;
        }
        debug!(port = self.port, "Executor endpoint shut down");
        Ok(())
    }
}

impl Drop for HttpExecutorEndpoint {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn invocation_response_handler(
    State(service): State<Arc<dyn ServiceEndpoint>>,
    Path(invoke_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    service
        .invocation_result(InvocationResult {
            invocation_id: invoke_id,
            payload: body,
        })
        .await;
    StatusCode::ACCEPTED
}

async fn invocation_error_handler(
    State(service): State<Arc<dyn ServiceEndpoint>>,
    Path(invoke_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    service
        .invocation_error(InvocationError {
            invocation_id: invoke_id,
            payload: body,
        })
        .await;
    StatusCode::ACCEPTED
}

#[derive(Deserialize)]
struct LogsBody {
    logs: String,
}

async fn invocation_logs_handler(
    State(service): State<Arc<dyn ServiceEndpoint>>,
    Path(invoke_id): Path<String>,
    Json(body): Json<LogsBody>,
) -> StatusCode {
    service
        .invocation_logs(InvocationLogs {
            invocation_id: invoke_id,
            logs: body.logs,
        })
        .await;
    StatusCode::ACCEPTED
}

async fn status_ready_handler(
    State(service): State<Arc<dyn ServiceEndpoint>>,
    Path(executor_id): Path<String>,
) -> StatusCode {
    service.status_ready(&executor_id).await;
    StatusCode::ACCEPTED
}

async fn status_error_handler(
    State(service): State<Arc<dyn ServiceEndpoint>>,
    Path(executor_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    service.status_error(&executor_id, body).await;
    StatusCode::ACCEPTED
}
