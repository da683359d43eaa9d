//! One-time preparation of a function version and its cleanup.
//!
//! Preparing stages the version's code under a deterministic directory,
//! makes sure the runtime's base image is cached locally and, if enabled,
//! bakes the init binary and code into a per-version image so executors can
//! skip copying them at start.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::{
    archive,
    context::RuntimeContext,
    error::{self, ExecutorError},
    function_version::FunctionVersion,
    naming::{self, INIT_BINARY_CONTEXT_NAME, RAPID_ENTRYPOINT, TASK_DIR},
};

/// A function version whose code is staged and whose image is available.
#[derive(Debug, Clone)]
pub struct PreparedVersion {
    pub version: FunctionVersion,
    /// Staged artifact directory.
    pub function_path: PathBuf,
    /// Extracted code inside the staged directory.
    pub code_path: PathBuf,
    pub base_image: String,
    /// Set only when pre-building was enabled and the build succeeded.
    pub prebuilt_image: Option<String>,
}

impl PreparedVersion {
    /// Image executors of this version are created from.
    pub fn image(&self) -> &str {
        self.prebuilt_image.as_deref().unwrap_or(&self.base_image)
    }
}

/// Build descriptor of a pre-built version image.
pub fn dockerfile(base_image: &str) -> String {
    format!(
        "FROM {base_image}\n\
         COPY {INIT_BINARY_CONTEXT_NAME} {RAPID_ENTRYPOINT}\n\
         COPY code/ {TASK_DIR}\n"
    )
}

pub struct VersionPreparer {
    ctx: RuntimeContext,
}

impl VersionPreparer {
    pub fn new(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }

    /// Stage `version` and make its image available.
    ///
    /// Callers must not run `prepare` and `cleanup` for the same version
    /// concurrently. A failed pre-build is logged and leaves the version
    /// without a pre-built image; it is attempted again by the next
    /// `prepare` of the version.
    pub async fn prepare(&self, version: &FunctionVersion) -> error::Result<PreparedVersion> {
        let start = Instant::now();
        let config = &self.ctx.config;
        let function_path = naming::function_path(config, version);
        let code_path = naming::code_path(config, version);

        let base_image = self.ctx.image_resolver.image_for_runtime(&version.runtime)?;

        self.stage_code(version, &function_path, &code_path)
            .await
            .map_err(|source| prepare_failed(version, source))?;

        self.ensure_base_image(&base_image)
            .await
            .map_err(|source| prepare_failed(version, source))?;

        let prebuilt_image = if config.prebuild_images {
            self.prebuild_image(version, &function_path, &base_image)
                .await
        } else {
            None
        };

        debug!(
            function = %version.qualified_arn(),
            duration_ms = %format!("{:.2}", start.elapsed().as_secs_f64() * 1000.0),
            prebuilt = prebuilt_image.is_some(),
            "Version preparation finished"
        );

        Ok(PreparedVersion {
            version: version.clone(),
            function_path,
            code_path,
            base_image,
            prebuilt_image,
        })
    }

    /// Remove what `prepare` left behind.
    ///
    /// A staged directory that cannot be removed is only logged. Failing to
    /// remove the pre-built image is returned to the caller.
    pub async fn cleanup(&self, version: &FunctionVersion) -> error::Result<()> {
        let config = &self.ctx.config;
        let function_path = naming::function_path(config, version);
        if let Err(e) = tokio::fs::remove_dir_all(&function_path).await {
            debug!(
                function = %version.qualified_arn(),
                path = %function_path.display(),
                error = %e,
                "Could not clean up function directory"
            );
        }

        if config.prebuild_images {
            let image_name = naming::image_name_for_function(config, version);
            self.ctx
                .container_client
                .remove_image(&image_name)
                .await
                .map_err(|source| ExecutorError::CleanupFailed {
                    function: version.qualified_arn(),
                    revision: version.internal_revision,
                    source,
                })?;
        }
        Ok(())
    }

    /// Write the version's archive to a scoped temp file inside the staged
    /// directory and unzip it into `code_path`.
    async fn stage_code(
        &self,
        version: &FunctionVersion,
        function_path: &Path,
        code_path: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(code_path)
            .await
            .with_context(|| format!("Failed to create code directory: {}", code_path.display()))?;

        // Removed when dropped, on success and on every error path below.
        let temp_archive = tempfile::Builder::new()
            .prefix("lambda-archive-")
            .suffix(".zip")
            .tempfile_in(function_path)
            .context("Failed to create temporary archive file")?;

        let file = temp_archive
            .reopen()
            .context("Failed to open temporary archive file")?;
        let mut file = tokio::fs::File::from_std(file);
        let mut stream = version.code.open().await?;
        let mut size = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len();
            file.write_all(&chunk)
                .await
                .context("Failed to write temporary archive file")?;
        }
        file.flush().await?;
        drop(file);

        let target = code_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let result = archive::unzip(temp_archive.path(), &target);
            drop(temp_archive);
            result
        })
        .await
        .context("Archive extraction task panicked")??;

        debug!(
            function = %version.qualified_arn(),
            archive_size = size,
            code_path = %code_path.display(),
            "Function code staged"
        );
        Ok(())
    }

    async fn ensure_base_image(&self, image: &str) -> Result<()> {
        let client = &self.ctx.container_client;
        let cached = client.list_image_names().await?;
        if cached.iter().any(|name| name == image) {
            debug!(image = %image, "Image already exists locally");
            return Ok(());
        }
        client.pull_image(image).await
    }

    async fn prebuild_image(
        &self,
        version: &FunctionVersion,
        function_path: &Path,
        base_image: &str,
    ) -> Option<String> {
        let image_name = naming::image_name_for_function(&self.ctx.config, version);
        match self
            .build_version_image(function_path, base_image, &image_name)
            .await
        {
            Ok(()) => {
                info!(
                    function = %version.qualified_arn(),
                    image = %image_name,
                    "Pre-built version image"
                );
                Some(image_name)
            }
            Err(e) => {
                debug!(
                    function = %version.qualified_arn(),
                    image = %image_name,
                    error = ?e,
                    "Pre-building version image failed"
                );
                error!(
                    function = %version.qualified_arn(),
                    error = %e,
                    "Error while building prebuilt lambda image, executors will copy code at start"
                );
                None
            }
        }
    }

    async fn build_version_image(
        &self,
        function_path: &Path,
        base_image: &str,
        image_name: &str,
    ) -> Result<()> {
        let init_source = &self.ctx.config.init_binary_path;
        let init_target = function_path.join(INIT_BINARY_CONTEXT_NAME);
        tokio::fs::copy(init_source, &init_target)
            .await
            .with_context(|| format!("Failed to copy init binary {}", init_source.display()))?;
        tokio::fs::set_permissions(&init_target, std::fs::Permissions::from_mode(0o755))
            .await
            .context("Failed to set init binary permissions")?;

        let dockerfile_path = function_path.join("Dockerfile");
        tokio::fs::write(&dockerfile_path, dockerfile(base_image))
            .await
            .with_context(|| format!("Failed to write {}", dockerfile_path.display()))?;

        self.ctx
            .container_client
            .build_image(function_path, image_name)
            .await
    }
}

fn prepare_failed(version: &FunctionVersion, source: anyhow::Error) -> ExecutorError {
    ExecutorError::PrepareFailed {
        function: version.qualified_arn(),
        revision: version.internal_revision,
        source,
    }
}
