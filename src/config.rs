use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";

/// Docker's stop API takes the grace period as an `i32` of seconds.
const MAX_STOP_TIMEOUT_SECS: u64 = i32::MAX as u64;

/// Prefix of environment variables overriding file configuration, e.g.
/// `LAMBDA_PREBUILD_IMAGES=true` or `LAMBDA_DOCKER__ADDRESS=...`.
pub const ENV_PREFIX: &str = "LAMBDA_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address. Supports:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    ///
    /// If not specified, uses Docker's default socket location.
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Environment name, anything but "local" switches to JSON logs.
    pub env: String,
    /// Bake the init binary and the function code into a per-version image
    /// while preparing the version, instead of copying them into every
    /// container at start.
    pub prebuild_images: bool,
    /// Maximum length of invocation payloads rendered into log lines.
    pub log_truncate_length: usize,
    /// Root under which staged artifact directories are created.
    pub temp_root: PathBuf,
    /// Subdirectory of `temp_root` holding all staged versions.
    pub namespace: String,
    /// Registry prefix of the vendor runtime images.
    pub image_prefix: String,
    /// Prefix of the images derived per function version.
    pub derived_image_prefix: String,
    /// Host path of the runtime init binary started as container entrypoint.
    pub init_binary_path: PathBuf,
    /// Network executor containers join. Defaults to Docker's `bridge`.
    pub network: Option<String>,
    /// Address under which containers reach the executor endpoints.
    pub callback_host: String,
    /// Interface the executor endpoints listen on.
    pub endpoint_bind_addr: String,
    /// Port of the runtime API inside the container.
    pub invocation_port: u16,
    /// Grace period given to a container before it is killed on stop.
    pub container_stop_timeout_secs: u64,
    pub docker: DockerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            env: LOCAL_ENV.to_string(),
            prebuild_images: false,
            log_truncate_length: 2000,
            temp_root: std::env::temp_dir(),
            namespace: "lambda".to_string(),
            image_prefix: "amazon/aws-lambda-".to_string(),
            derived_image_prefix: "localstack/lambda".to_string(),
            init_binary_path: PathBuf::from("/usr/local/bin/aws-lambda-rie"),
            network: None,
            callback_host: "172.17.0.1".to_string(),
            endpoint_bind_addr: "0.0.0.0".to_string(),
            invocation_port: 9563,
            container_stop_timeout_secs: 5,
            docker: DockerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_path(path: &str) -> Result<ExecutorConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ExecutorConfig> {
        Self::from_figment(Figment::new().merge(Yaml::string(config_str)))
    }

    /// Configuration from defaults and `LAMBDA_*` environment variables only.
    pub fn from_env() -> Result<ExecutorConfig> {
        Self::from_figment(Figment::new())
    }

    fn from_figment(figment: Figment) -> Result<ExecutorConfig> {
        let config: ExecutorConfig = Figment::from(Serialized::defaults(ExecutorConfig::default()))
            .merge(figment)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(anyhow::anyhow!(
                "namespace must be a single non-empty path segment, got: {:?}",
                self.namespace
            ));
        }
        if self.image_prefix.is_empty() || self.derived_image_prefix.is_empty() {
            return Err(anyhow::anyhow!("image prefixes must not be empty"));
        }
        if self.log_truncate_length == 0 {
            return Err(anyhow::anyhow!("log_truncate_length must be positive"));
        }
        if self.container_stop_timeout_secs > MAX_STOP_TIMEOUT_SECS {
            return Err(anyhow::anyhow!(
                "container_stop_timeout_secs must be at most {MAX_STOP_TIMEOUT_SECS}, got: {}",
                self.container_stop_timeout_secs
            ));
        }
        if self.endpoint_bind_addr.parse::<IpAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid endpoint bind address: {}",
                self.endpoint_bind_addr
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn network_name(&self) -> &str {
        self.network.as_deref().unwrap_or("bridge")
    }

    pub fn container_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.container_stop_timeout_secs)
    }
}
