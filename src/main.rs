use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lambda_executor::{
    function_version::InMemoryArchive,
    tracing::setup_tracing,
    ChannelServiceEndpoint,
    CodeArchive,
    DockerRuntimeExecutor,
    ExecutorConfig,
    ExecutorEvent,
    FunctionVersion,
    FunctionVersionId,
    InvocationPayload,
    LocalArchive,
    RuntimeContext,
    VersionPreparer,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lambda-executor")]
#[command(version, about = "Run function versions in Docker executors", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage a function version and make its image available
    Prepare {
        #[command(flatten)]
        version: VersionArgs,
        /// Zip archive holding the function code
        #[arg(long)]
        code: PathBuf,
    },
    /// Remove the staged artifacts and derived image of a version
    Cleanup {
        #[command(flatten)]
        version: VersionArgs,
    },
    /// Prepare a version, invoke it once in a fresh executor and tear down
    Run {
        #[command(flatten)]
        version: VersionArgs,
        #[arg(long)]
        code: PathBuf,
        /// Event passed to the function
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Extra container environment, as KEY=VALUE
        #[arg(long = "env", value_parser = parse_env_var)]
        env_vars: Vec<(String, String)>,
        #[arg(long, default_value_t = 30)]
        ready_timeout_secs: u64,
        #[arg(long, default_value_t = 60)]
        invoke_timeout_secs: u64,
    },
}

#[derive(Args)]
struct VersionArgs {
    /// Qualified function ARN
    #[arg(long)]
    arn: String,
    #[arg(long)]
    runtime: String,
    #[arg(long, default_value_t = 1)]
    revision: u64,
}

impl VersionArgs {
    fn function_version(&self, code: Arc<dyn CodeArchive>) -> Result<FunctionVersion> {
        let id = FunctionVersionId::parse(&self.arn)?;
        Ok(FunctionVersion::new(id, &self.runtime, self.revision, code))
    }
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => ExecutorConfig::from_path(
            path.to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?,
        )?,
        None => ExecutorConfig::from_env().context("Failed to load configuration")?,
    };

    setup_tracing(&config)?;

    let ctx = RuntimeContext::docker(config).context("Failed to connect to Docker")?;
    let preparer = VersionPreparer::new(ctx.clone());

    match cli.command {
        Command::Prepare { version, code } => {
            let version = version.function_version(Arc::new(LocalArchive::new(code)))?;
            let prepared = preparer.prepare(&version).await?;
            info!(
                function = %version.qualified_arn(),
                image = %prepared.image(),
                code_path = %prepared.code_path.display(),
                "Version prepared"
            );
        }
        Command::Cleanup { version } => {
            let version = version.function_version(Arc::new(InMemoryArchive::new(Vec::new())))?;
            preparer.cleanup(&version).await?;
            info!(function = %version.qualified_arn(), "Version cleaned up");
        }
        Command::Run {
            version,
            code,
            payload,
            env_vars,
            ready_timeout_secs,
            invoke_timeout_secs,
        } => {
            let version = version.function_version(Arc::new(LocalArchive::new(code)))?;
            let prepared = Arc::new(preparer.prepare(&version).await?);

            let (service, events) = ChannelServiceEndpoint::new();
            let executor_id = uuid::Uuid::new_v4().to_string();
            let mut executor =
                DockerRuntimeExecutor::new(&executor_id, prepared, Arc::new(service), ctx)?;

            let outcome = run_once(
                &mut executor,
                events,
                env_vars.into_iter().collect(),
                payload,
                Duration::from_secs(ready_timeout_secs),
                Duration::from_secs(invoke_timeout_secs),
            )
            .await;

            if let Err(e) = executor.stop().await {
                warn!(executor_id = %executor_id, error = %e, "Failed to stop executor");
            }
            preparer.cleanup(&version).await?;
            outcome?;
        }
    }
    Ok(())
}

async fn run_once(
    executor: &mut DockerRuntimeExecutor,
    mut events: UnboundedReceiver<ExecutorEvent>,
    mut env_vars: BTreeMap<String, String>,
    payload: String,
    ready_timeout: Duration,
    invoke_timeout: Duration,
) -> Result<()> {
    let function = executor.function_version().clone();
    env_vars.insert("LOCALSTACK_RUNTIME_ID".to_string(), executor.id().to_string());
    env_vars.insert("LOCALSTACK_RUNTIME_ENDPOINT".to_string(), executor.runtime_endpoint());
    env_vars.insert(
        "AWS_LAMBDA_FUNCTION_NAME".to_string(),
        function.id.function_name.clone(),
    );
    env_vars.insert("AWS_LAMBDA_FUNCTION_VERSION".to_string(), function.id.qualifier.clone());
    env_vars.insert("AWS_REGION".to_string(), function.id.region.clone());

    executor.start(env_vars).await?;

    tokio::time::timeout(ready_timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                ExecutorEvent::Ready { .. } => return Ok(()),
                ExecutorEvent::StatusError { details, .. } => {
                    return Err(anyhow::anyhow!(
                        "Executor failed to initialize: {}",
                        String::from_utf8_lossy(&details)
                    ))
                }
                _ => {}
            }
        }
        Err(anyhow::anyhow!("Executor event channel closed"))
    })
    .await
    .context("Timed out waiting for the executor to become ready")??;

    let invocation_id = uuid::Uuid::new_v4().to_string();
    let request = InvocationPayload::from([
        ("invoke-id".to_string(), invocation_id.clone()),
        ("invoked-function-arn".to_string(), function.qualified_arn()),
        ("payload".to_string(), payload),
    ]);
    executor.invoke(&request).await?;

    tokio::time::timeout(invoke_timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                ExecutorEvent::Result(result) if result.invocation_id == invocation_id => {
                    println!("{}", String::from_utf8_lossy(&result.payload));
                    return Ok(());
                }
                ExecutorEvent::Error(error) if error.invocation_id == invocation_id => {
                    return Err(anyhow::anyhow!(
                        "Invocation failed: {}",
                        String::from_utf8_lossy(&error.payload)
                    ));
                }
                ExecutorEvent::Logs(logs) => eprint!("{}", logs.logs),
                _ => {}
            }
        }
        Err(anyhow::anyhow!("Executor event channel closed"))
    })
    .await
    .context("Timed out waiting for the invocation result")?
}
