//! Deterministic filesystem paths and image names derived from a function
//! version.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::{config::ExecutorConfig, function_version::FunctionVersion};

/// Location of the runtime init binary inside executor containers.
pub const RAPID_ENTRYPOINT: &str = "/var/rapid/init";

/// Directory holding the function code inside executor containers.
pub const TASK_DIR: &str = "/var/task";

/// Name of the init binary inside a staged directory used as build context.
pub const INIT_BINARY_CONTEXT_NAME: &str = "aws-lambda-rie";

const CODE_DIR: &str = "code";

/// Hex characters of the ARN digest carried in derived names.
const DIGEST_LEN: usize = 16;

/// Replace ARN delimiters that are not filesystem or image-name safe.
///
/// Lossy: `_` is a valid name character too, so derived names pair this
/// with [`arn_digest`].
pub fn sanitize(qualified_arn: &str) -> String {
    qualified_arn.replace([':', '$'], "_")
}

/// Leading hex characters of the SHA-256 of the exact, case-sensitive ARN.
pub fn arn_digest(qualified_arn: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(qualified_arn.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..DIGEST_LEN].to_string()
}

/// `<temp-root>/<namespace>/<sanitized-arn>_<digest>_<revision>/`
pub fn function_path(config: &ExecutorConfig, version: &FunctionVersion) -> PathBuf {
    let arn = version.qualified_arn();
    config.temp_root.join(&config.namespace).join(format!(
        "{}_{}_{}",
        sanitize(&arn),
        arn_digest(&arn),
        version.internal_revision
    ))
}

pub fn code_path(config: &ExecutorConfig, version: &FunctionVersion) -> PathBuf {
    function_path(config, version).join(CODE_DIR)
}

/// `<derived-prefix>-<sanitized-arn lowercased>-<digest>:<revision>`
///
/// The revision is carried in the tag so that rebuilding a new revision
/// never overwrites the image executors of the previous one still use.
pub fn image_name_for_function(config: &ExecutorConfig, version: &FunctionVersion) -> String {
    let arn = version.qualified_arn();
    format!(
        "{}-{}-{}:{}",
        config.derived_image_prefix,
        sanitize(&arn).to_lowercase(),
        arn_digest(&arn),
        version.internal_revision
    )
}
