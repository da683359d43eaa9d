//! Image resolution for executor containers.

use crate::error::{ExecutorError, Result};

/// Vendor image repository and tag per runtime identifier, appended to the
/// configured image prefix.
const IMAGE_MAPPING: &[(&str, &str)] = &[
    ("python3.7", "python:3.7"),
    ("python3.8", "python:3.8"),
    ("python3.9", "python:3.9"),
    ("python3.10", "python:3.10"),
    ("python3.11", "python:3.11"),
    ("nodejs12.x", "nodejs:12"),
    ("nodejs14.x", "nodejs:14"),
    ("nodejs16.x", "nodejs:16"),
    ("nodejs18.x", "nodejs:18"),
    ("ruby2.7", "ruby:2.7"),
    ("ruby3.2", "ruby:3.2"),
    ("java8", "java:8"),
    ("java8.al2", "java:8.al2"),
    ("java11", "java:11"),
    ("java17", "java:17"),
    ("dotnetcore3.1", "dotnet:core3.1"),
    ("dotnet6", "dotnet:6"),
    ("go1.x", "go:1"),
    ("provided", "provided:alami"),
    ("provided.al2", "provided:al2"),
];

/// Resolves the base image a runtime's executors are launched from.
pub trait ImageResolver: Send + Sync {
    fn image_for_runtime(&self, runtime: &str) -> Result<String>;
}

/// Resolver backed by the static runtime table.
pub struct StaticImageResolver {
    image_prefix: String,
}

impl StaticImageResolver {
    pub fn new(image_prefix: impl Into<String>) -> Self {
        Self {
            image_prefix: image_prefix.into(),
        }
    }

    pub fn supported_runtimes() -> impl Iterator<Item = &'static str> {
        IMAGE_MAPPING.iter().map(|(runtime, _)| *runtime)
    }
}

impl ImageResolver for StaticImageResolver {
    fn image_for_runtime(&self, runtime: &str) -> Result<String> {
        IMAGE_MAPPING
            .iter()
            .find(|(candidate, _)| *candidate == runtime)
            .map(|(_, postfix)| format!("{}{}", self.image_prefix, postfix))
            .ok_or_else(|| ExecutorError::UnsupportedRuntime {
                runtime: runtime.to_string(),
            })
    }
}
