//! In-process fakes for the container runtime and the executor endpoint.

use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, TcpListener},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::ExecutorConfig,
    container::{ContainerClient, ContainerConfiguration},
    context::RuntimeContext,
    endpoint::{
        EndpointFactory,
        ExecutorEndpoint,
        InvocationError,
        InvocationLogs,
        InvocationPayload,
        InvocationResult,
        ServiceEndpoint,
    },
    function_version::{FunctionVersion, FunctionVersionId, InMemoryArchive},
    service::ExecutorEvent,
};

pub const TEST_NETWORK: &str = "lambda-test-net";

#[derive(Default)]
struct Failures {
    pull: bool,
    build: bool,
    remove_image: bool,
    create: bool,
    start: bool,
    stop: bool,
    remove_container: bool,
}

#[derive(Default)]
struct ClientState {
    images: BTreeSet<String>,
    pulled: Vec<String>,
    built: Vec<String>,
    removed: Vec<String>,
    created: Vec<ContainerConfiguration>,
    copies: Vec<(String, PathBuf, String)>,
    calls: Vec<String>,
    fail: Failures,
}

/// Records container operations; image operations keep a local image set.
#[derive(Default)]
pub struct FakeContainerClient {
    state: Mutex<ClientState>,
}

impl FakeContainerClient {
    pub const CONTAINER_IP: Ipv4Addr = Ipv4Addr::new(172, 18, 0, 2);

    fn with_state<T>(&self, f: impl FnOnce(&mut ClientState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail_pull(&self) {
        self.with_state(|s| s.fail.pull = true);
    }

    pub fn fail_build(&self) {
        self.with_state(|s| s.fail.build = true);
    }

    pub fn fail_remove_image(&self) {
        self.with_state(|s| s.fail.remove_image = true);
    }

    pub fn fail_create(&self) {
        self.with_state(|s| s.fail.create = true);
    }

    pub fn fail_start(&self) {
        self.with_state(|s| s.fail.start = true);
    }

    pub fn fail_stop(&self) {
        self.with_state(|s| s.fail.stop = true);
    }

    pub fn fail_remove_container(&self) {
        self.with_state(|s| s.fail.remove_container = true);
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.with_state(|s| s.pulled.clone())
    }

    pub fn built_images(&self) -> Vec<String> {
        self.with_state(|s| s.built.clone())
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.with_state(|s| s.removed.clone())
    }

    pub fn created_containers(&self) -> Vec<ContainerConfiguration> {
        self.with_state(|s| s.created.clone())
    }

    pub fn copies(&self) -> Vec<(String, PathBuf, String)> {
        self.with_state(|s| s.copies.clone())
    }

    /// Container operations in call order, e.g. `start exec-1`.
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count_calls(&self, call: &str) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| *c == call).count())
    }

    fn record(&self, call: String) {
        self.with_state(|s| s.calls.push(call));
    }
}

#[async_trait]
impl ContainerClient for FakeContainerClient {
    async fn build_image(&self, context_dir: &Path, image_name: &str) -> Result<()> {
        if !context_dir.join("Dockerfile").exists() {
            return Err(anyhow!("no Dockerfile in {}", context_dir.display()));
        }
        self.with_state(|s| {
            if s.fail.build {
                return Err(anyhow!("build of {image_name} failed"));
            }
            s.built.push(image_name.to_string());
            s.images.insert(image_name.to_string());
            Ok(())
        })
    }

    async fn pull_image(&self, image_name: &str) -> Result<()> {
        self.with_state(|s| {
            if s.fail.pull {
                return Err(anyhow!("pull access denied for {image_name}"));
            }
            s.pulled.push(image_name.to_string());
            s.images.insert(image_name.to_string());
            Ok(())
        })
    }

    async fn list_image_names(&self) -> Result<Vec<String>> {
        Ok(self.with_state(|s| s.images.iter().cloned().collect()))
    }

    async fn remove_image(&self, image_name: &str) -> Result<()> {
        self.with_state(|s| {
            if s.fail.remove_image {
                return Err(anyhow!("image {image_name} is in use"));
            }
            s.removed.push(image_name.to_string());
            s.images.remove(image_name);
            Ok(())
        })
    }

    async fn create_container(&self, config: &ContainerConfiguration) -> Result<String> {
        self.record(format!("create {}", config.name));
        self.with_state(|s| {
            if s.fail.create {
                return Err(anyhow!("no such image: {}", config.image_name));
            }
            s.created.push(config.clone());
            Ok(format!("id-{}", config.name))
        })
    }

    async fn start_container(&self, container_name: &str) -> Result<()> {
        self.record(format!("start {container_name}"));
        if self.with_state(|s| s.fail.start) {
            return Err(anyhow!("container {container_name} exited immediately"));
        }
        Ok(())
    }

    async fn stop_container(&self, container_name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop {container_name}"));
        if self.with_state(|s| s.fail.stop) {
            return Err(anyhow!("container {container_name} did not stop"));
        }
        Ok(())
    }

    async fn remove_container(&self, container_name: &str, force: bool) -> Result<()> {
        let call = if force { "force-remove" } else { "remove" };
        self.record(format!("{call} {container_name}"));
        if self.with_state(|s| s.fail.remove_container) {
            return Err(anyhow!("removal of {container_name} is already in progress"));
        }
        Ok(())
    }

    async fn copy_into_container(
        &self,
        container_name: &str,
        local_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.record(format!("copy {container_name}"));
        self.with_state(|s| {
            s.copies.push((
                container_name.to_string(),
                local_path.to_path_buf(),
                container_path.to_string(),
            ))
        });
        Ok(())
    }

    async fn container_ipv4_for_network(
        &self,
        container_name: &str,
        _network: &str,
    ) -> Result<Ipv4Addr> {
        self.record(format!("inspect {container_name}"));
        Ok(Self::CONTAINER_IP)
    }
}

/// State shared by all endpoints of one [`FakeEndpointFactory`].
#[derive(Default)]
pub struct EndpointRecorder {
    started: AtomicBool,
    shutdowns: AtomicUsize,
    fail_shutdown: AtomicBool,
    container_address: Mutex<Option<Ipv4Addr>>,
    invocations: Mutex<Vec<InvocationPayload>>,
}

impl EndpointRecorder {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn fail_shutdown(&self) {
        self.fail_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn container_address(&self) -> Option<Ipv4Addr> {
        *self.container_address.lock().unwrap()
    }

    pub fn invocations(&self) -> Vec<InvocationPayload> {
        self.invocations.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeEndpointFactory {
    recorder: Arc<EndpointRecorder>,
}

impl FakeEndpointFactory {
    pub fn recorder(&self) -> Arc<EndpointRecorder> {
        self.recorder.clone()
    }
}

impl EndpointFactory for FakeEndpointFactory {
    fn create(
        &self,
        listener: TcpListener,
        _service: Arc<dyn ServiceEndpoint>,
    ) -> Result<Box<dyn ExecutorEndpoint>> {
        let port = listener.local_addr()?.port();
        Ok(Box::new(FakeEndpoint {
            port,
            _listener: listener,
            recorder: self.recorder.clone(),
        }))
    }
}

struct FakeEndpoint {
    port: u16,
    _listener: TcpListener,
    recorder: Arc<EndpointRecorder>,
}

#[async_trait]
impl ExecutorEndpoint for FakeEndpoint {
    fn port(&self) -> u16 {
        self.port
    }

    async fn start(&mut self) -> Result<()> {
        self.recorder.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_container_address(&mut self, address: Ipv4Addr) {
        *self.recorder.container_address.lock().unwrap() = Some(address);
    }

    async fn invoke(&self, payload: &InvocationPayload) -> Result<()> {
        self.recorder.invocations.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.recorder.fail_shutdown.load(Ordering::SeqCst) {
            return Err(anyhow!("endpoint server task failed"));
        }
        Ok(())
    }
}

/// [`ServiceEndpoint`] keeping every callback in memory.
#[derive(Default)]
pub struct RecordingService {
    events: Mutex<Vec<ExecutorEvent>>,
}

impl RecordingService {
    pub fn events(&self) -> Vec<ExecutorEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: ExecutorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ServiceEndpoint for RecordingService {
    async fn invocation_result(&self, result: InvocationResult) {
        self.push(ExecutorEvent::Result(result));
    }

    async fn invocation_error(&self, error: InvocationError) {
        self.push(ExecutorEvent::Error(error));
    }

    async fn invocation_logs(&self, logs: InvocationLogs) {
        self.push(ExecutorEvent::Logs(logs));
    }

    async fn status_ready(&self, executor_id: &str) {
        self.push(ExecutorEvent::Ready {
            executor_id: executor_id.to_string(),
        });
    }

    async fn status_error(&self, executor_id: &str, details: Bytes) {
        self.push(ExecutorEvent::StatusError {
            executor_id: executor_id.to_string(),
            details,
        });
    }
}

/// Context staging under `dir`, with an init binary placed in `dir` and
/// fake endpoints bound to localhost.
pub fn test_context(
    dir: &Path,
    client: Arc<FakeContainerClient>,
    prebuild: bool,
) -> RuntimeContext {
    let init_binary_path = dir.join("aws-lambda-rie-host");
    std::fs::write(&init_binary_path, b"#!/bin/sh\n").unwrap();

    let config = ExecutorConfig {
        prebuild_images: prebuild,
        temp_root: dir.to_path_buf(),
        init_binary_path,
        network: Some(TEST_NETWORK.to_string()),
        endpoint_bind_addr: "127.0.0.1".to_string(),
        ..ExecutorConfig::default()
    };
    RuntimeContext::new(config, client)
        .unwrap()
        .with_endpoint_factory(Arc::new(FakeEndpointFactory::default()))
}

pub fn test_version(name: &str, revision: u64, archive: Vec<u8>) -> FunctionVersion {
    let id = FunctionVersionId::new("us-east-1", "000000000000", name, "$LATEST").unwrap();
    FunctionVersion::new(id, "python3.9", revision, Arc::new(InMemoryArchive::new(archive)))
}
