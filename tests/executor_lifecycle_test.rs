//! End-to-end executor lifecycle against the real HTTP endpoint.
//!
//! The container runtime is faked: every container "runs" on localhost,
//! where an axum server stands in for the runtime API inside the container.
//!
//! The Docker tests at the bottom are SKIPPED by default. To run them, set
//! RUN_DOCKER_TESTS=1.

use std::{
    collections::BTreeMap,
    io::Write,
    net::Ipv4Addr,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{http::StatusCode, routing::post, Json, Router};
use lambda_executor::{
    function_version::InMemoryArchive,
    naming,
    ChannelServiceEndpoint,
    ContainerClient,
    ContainerConfiguration,
    DockerClient,
    DockerRuntimeExecutor,
    ExecutorConfig,
    ExecutorError,
    ExecutorEvent,
    ExecutorStatus,
    FunctionVersion,
    FunctionVersionId,
    InvocationPayload,
    RuntimeContext,
    VersionPreparer,
};
use tokio::sync::mpsc;

/// Container runtime whose containers all live at 127.0.0.1.
#[derive(Default)]
struct LocalhostContainerClient {
    running: Mutex<Vec<String>>,
    images: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerClient for LocalhostContainerClient {
    async fn build_image(&self, _context_dir: &Path, image_name: &str) -> Result<()> {
        self.images.lock().unwrap().push(image_name.to_string());
        Ok(())
    }

    async fn pull_image(&self, image_name: &str) -> Result<()> {
        self.images.lock().unwrap().push(image_name.to_string());
        Ok(())
    }

    async fn list_image_names(&self) -> Result<Vec<String>> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn remove_image(&self, image_name: &str) -> Result<()> {
        self.images.lock().unwrap().retain(|i| i != image_name);
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfiguration) -> Result<String> {
        Ok(config.name.clone())
    }

    async fn start_container(&self, container_name: &str) -> Result<()> {
        self.running.lock().unwrap().push(container_name.to_string());
        Ok(())
    }

    async fn stop_container(&self, container_name: &str, _timeout: Duration) -> Result<()> {
        self.running.lock().unwrap().retain(|c| c != container_name);
        Ok(())
    }

    async fn remove_container(&self, _container_name: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn copy_into_container(
        &self,
        _container_name: &str,
        local_path: &Path,
        _container_path: &str,
    ) -> Result<()> {
        anyhow::ensure!(local_path.exists(), "{} does not exist", local_path.display());
        Ok(())
    }

    async fn container_ipv4_for_network(
        &self,
        _container_name: &str,
        _network: &str,
    ) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::LOCALHOST)
    }
}

fn zip_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn function_version(archive: Vec<u8>) -> FunctionVersion {
    let id = FunctionVersionId::parse("arn:aws:lambda:us-east-1:000000000000:function:echo:$LATEST")
        .unwrap();
    FunctionVersion::new(id, "python3.11", 1, Arc::new(InMemoryArchive::new(archive)))
}

/// Stand-in for the runtime API inside the container.
async fn start_runtime_api() -> (u16, mpsc::UnboundedReceiver<InvocationPayload>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/invoke",
        post(move |Json(payload): Json<InvocationPayload>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
                StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, rx)
}

fn config(dir: &Path, invocation_port: u16) -> ExecutorConfig {
    let init_binary_path = dir.join("aws-lambda-rie");
    std::fs::write(&init_binary_path, b"#!/bin/sh\n").unwrap();
    ExecutorConfig {
        temp_root: dir.to_path_buf(),
        init_binary_path,
        endpoint_bind_addr: "127.0.0.1".to_string(),
        invocation_port,
        ..ExecutorConfig::default()
    }
}

#[tokio::test]
async fn test_executor_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime_port, mut invocations) = start_runtime_api().await;
    let client = Arc::new(LocalhostContainerClient::default());
    let ctx = RuntimeContext::new(config(dir.path(), runtime_port), client.clone()).unwrap();

    let preparer = VersionPreparer::new(ctx.clone());
    let version = function_version(zip_archive(&[(
        "handler.py",
        b"def handler(event, context):\n    return event\n",
    )]));
    let prepared = Arc::new(preparer.prepare(&version).await.unwrap());
    assert!(prepared.code_path.join("handler.py").exists());

    let (service, mut events) = ChannelServiceEndpoint::new();
    let mut executor =
        DockerRuntimeExecutor::new("exec-1", prepared.clone(), Arc::new(service), ctx.clone())
            .unwrap();
    assert!(matches!(
        executor.address(),
        Err(ExecutorError::NotReady { .. })
    ));

    executor.start(BTreeMap::new()).await.unwrap();
    assert_eq!(executor.state(), ExecutorStatus::Running);
    assert_eq!(executor.address().unwrap(), Ipv4Addr::LOCALHOST);

    // container reports readiness through the executor endpoint
    let callbacks = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", executor.port());
    let status = callbacks
        .post(format!("{base}/status/exec-1/ready"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert_eq!(
        events.recv().await.unwrap(),
        ExecutorEvent::Ready {
            executor_id: "exec-1".to_string()
        }
    );

    let payload = InvocationPayload::from([
        ("invoke-id".to_string(), "inv-1".to_string()),
        ("payload".to_string(), "{\"key\":\"value\"}".to_string()),
    ]);
    executor.invoke(&payload).await.unwrap();
    assert_eq!(invocations.recv().await.unwrap(), payload);

    callbacks
        .post(format!("{base}/invocations/inv-1/response"))
        .body("{\"key\":\"value\"}")
        .send()
        .await
        .unwrap();
    match events.recv().await.unwrap() {
        ExecutorEvent::Result(result) => {
            assert_eq!(result.invocation_id, "inv-1");
            assert_eq!(&result.payload[..], b"{\"key\":\"value\"}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let port = executor.port();
    executor.stop().await.unwrap();
    assert_eq!(executor.state(), ExecutorStatus::Stopped);
    assert!(client.running.lock().unwrap().is_empty());
    assert!(callbacks
        .post(format!("http://127.0.0.1:{port}/status/exec-1/ready"))
        .send()
        .await
        .is_err());

    preparer.cleanup(&version).await.unwrap();
    assert!(!naming::function_path(&ctx.config, &version).exists());
}

#[tokio::test]
async fn test_executors_of_one_version_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime_port, _invocations) = start_runtime_api().await;
    let client = Arc::new(LocalhostContainerClient::default());
    let ctx = RuntimeContext::new(config(dir.path(), runtime_port), client).unwrap();

    let version = function_version(zip_archive(&[("handler.py", b"pass")]));
    let prepared = Arc::new(VersionPreparer::new(ctx.clone()).prepare(&version).await.unwrap());

    let mut executors = Vec::new();
    for i in 0..3 {
        let (service, _events) = ChannelServiceEndpoint::new();
        let mut executor = DockerRuntimeExecutor::new(
            format!("exec-{i}"),
            prepared.clone(),
            Arc::new(service),
            ctx.clone(),
        )
        .unwrap();
        executor.start(BTreeMap::new()).await.unwrap();
        executors.push(executor);
    }

    let mut ports: Vec<u16> = executors.iter().map(|e| e.port()).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);

    for executor in &mut executors {
        executor.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_invoke_fails_when_runtime_api_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let app = Router::new().route("/invoke", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runtime_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let ctx = RuntimeContext::new(
        config(dir.path(), runtime_port),
        Arc::new(LocalhostContainerClient::default()),
    )
    .unwrap();
    let version = function_version(zip_archive(&[("handler.py", b"pass")]));
    let prepared = Arc::new(VersionPreparer::new(ctx.clone()).prepare(&version).await.unwrap());

    let (service, _events) = ChannelServiceEndpoint::new();
    let mut executor =
        DockerRuntimeExecutor::new("exec-1", prepared, Arc::new(service), ctx).unwrap();
    executor.start(BTreeMap::new()).await.unwrap();

    let err = executor
        .invoke(&InvocationPayload::from([("k".to_string(), "v".to_string())]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::InvokeFailed { .. }));
    executor.stop().await.unwrap();
}

/// Check if Docker tests should run
fn should_run_docker_tests() -> bool {
    std::env::var("RUN_DOCKER_TESTS")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::test]
async fn test_docker_pull_build_and_remove_image() {
    if !should_run_docker_tests() {
        eprintln!("Skipping Docker test. Set RUN_DOCKER_TESTS=1 to run.");
        return;
    }

    let docker = DockerClient::new().unwrap();
    let base = "busybox:latest";
    docker.pull_image(base).await.unwrap();
    assert!(docker
        .list_image_names()
        .await
        .unwrap()
        .contains(&base.to_string()));

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("code")).unwrap();
    std::fs::write(dir.path().join("code/handler.py"), b"pass").unwrap();
    std::fs::write(
        dir.path().join("Dockerfile"),
        format!("FROM {base}\nCOPY code/ /var/task\n"),
    )
    .unwrap();

    let image = "localstack/lambda-test-build:1";
    docker.build_image(dir.path(), image).await.unwrap();
    assert!(docker
        .list_image_names()
        .await
        .unwrap()
        .contains(&image.to_string()));

    docker.remove_image(image).await.unwrap();
    assert!(!docker
        .list_image_names()
        .await
        .unwrap()
        .contains(&image.to_string()));
}
