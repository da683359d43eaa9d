//! Docker-backed executors for serverless function versions.
//!
//! A [`VersionPreparer`] stages a function version once (code extracted,
//! base image pulled, optionally a per-version image built). Any number of
//! [`DockerRuntimeExecutor`]s then run the prepared version, each in its own
//! container wired to its own [`ExecutorEndpoint`].

pub mod archive;
pub mod config;
pub mod container;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod function_version;
pub mod image_resolver;
pub mod naming;
pub mod network;
pub mod service;
pub mod tracing;
pub mod utils;
pub mod version_preparer;

#[cfg(test)]
mod testing;

pub use config::ExecutorConfig;
pub use container::{ContainerClient, ContainerConfiguration, DockerClient};
pub use context::RuntimeContext;
pub use endpoint::{
    EndpointFactory,
    ExecutorEndpoint,
    HttpEndpointFactory,
    InvocationPayload,
    ServiceEndpoint,
};
pub use error::{ExecutorError, Result};
pub use executor::{DockerRuntimeExecutor, ExecutorStatus};
pub use function_version::{CodeArchive, FunctionVersion, FunctionVersionId, LocalArchive};
pub use service::{ChannelServiceEndpoint, ExecutorEvent};
pub use version_preparer::{PreparedVersion, VersionPreparer};
