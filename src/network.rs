use anyhow::Result;
use async_trait::async_trait;

/// Supplies the network an executor's container joins.
///
/// The returned name must stay valid for the executor's whole lifetime: it is
/// used both to create the container and to look up its address.
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    async fn network_for_executor(&self, executor_id: &str) -> Result<String>;
}

/// Attaches every executor to one pre-existing network.
pub struct StaticNetworkProvisioner {
    network: String,
}

impl StaticNetworkProvisioner {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }
}

#[async_trait]
impl NetworkProvisioner for StaticNetworkProvisioner {
    async fn network_for_executor(&self, _executor_id: &str) -> Result<String> {
        Ok(self.network.clone())
    }
}
