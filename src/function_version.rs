//! Function version model and the storage the version's code archive is read
//! from.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::io::ReaderStream;

const MAX_FUNCTION_NAME_LEN: usize = 64;
const LATEST_QUALIFIER: &str = "$LATEST";

/// Qualified identity of a function version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionVersionId {
    pub region: String,
    pub account: String,
    pub function_name: String,
    pub qualifier: String,
}

impl FunctionVersionId {
    pub fn new(
        region: impl Into<String>,
        account: impl Into<String>,
        function_name: impl Into<String>,
        qualifier: impl Into<String>,
    ) -> Result<Self> {
        let id = Self {
            region: region.into(),
            account: account.into(),
            function_name: function_name.into(),
            qualifier: qualifier.into(),
        };
        id.validate()?;
        Ok(id)
    }

    /// Parse `arn:aws:lambda:<region>:<account>:function:<name>:<qualifier>`.
    pub fn parse(arn: &str) -> Result<Self> {
        let parts: Vec<&str> = arn.split(':').collect();
        match parts.as_slice() {
            ["arn", _partition, "lambda", region, account, "function", name, qualifier] => {
                Self::new(*region, *account, *name, *qualifier)
            }
            _ => Err(anyhow::anyhow!("not a qualified function ARN: {arn}")),
        }
    }

    pub fn qualified_arn(&self) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}:{}",
            self.region, self.account, self.function_name, self.qualifier
        )
    }

    fn validate(&self) -> Result<()> {
        if self.region.is_empty() || !self.region.chars().all(is_name_char) {
            anyhow::bail!("invalid region: {:?}", self.region);
        }
        if self.account.is_empty() || !self.account.chars().all(|c| c.is_ascii_digit()) {
            anyhow::bail!("invalid account: {:?}", self.account);
        }
        if self.function_name.is_empty() ||
            self.function_name.len() > MAX_FUNCTION_NAME_LEN ||
            !self.function_name.chars().all(is_name_char)
        {
            anyhow::bail!("invalid function name: {:?}", self.function_name);
        }
        let qualifier_ok = self.qualifier == LATEST_QUALIFIER ||
            (!self.qualifier.is_empty() && self.qualifier.chars().all(is_name_char));
        if !qualifier_ok {
            anyhow::bail!("invalid qualifier: {:?}", self.qualifier);
        }
        Ok(())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

impl fmt::Display for FunctionVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_arn())
    }
}

/// Source of a version's zipped code payload.
#[async_trait]
pub trait CodeArchive: Send + Sync {
    /// Open the archive as a stream of byte chunks.
    async fn open(&self) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Archive stored on the local filesystem.
pub struct LocalArchive {
    path: PathBuf,
}

impl LocalArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CodeArchive for LocalArchive {
    async fn open(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open code archive: {}", self.path.display()))?;
        Ok(ReaderStream::new(file)
            .map(|chunk| chunk.context("Failed to read code archive"))
            .boxed())
    }
}

/// Archive held in memory, e.g. uploaded inline with the function.
pub struct InMemoryArchive {
    data: Bytes,
}

impl InMemoryArchive {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl CodeArchive for InMemoryArchive {
    async fn open(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        Ok(stream::once(futures::future::ready(Ok(self.data.clone()))).boxed())
    }
}

/// An immutable, revisioned deployment unit of user code.
#[derive(Clone)]
pub struct FunctionVersion {
    pub id: FunctionVersionId,
    pub runtime: String,
    pub internal_revision: u64,
    pub code: Arc<dyn CodeArchive>,
}

impl FunctionVersion {
    pub fn new(
        id: FunctionVersionId,
        runtime: impl Into<String>,
        internal_revision: u64,
        code: Arc<dyn CodeArchive>,
    ) -> Self {
        Self {
            id,
            runtime: runtime.into(),
            internal_revision,
            code,
        }
    }

    pub fn qualified_arn(&self) -> String {
        self.id.qualified_arn()
    }
}

impl fmt::Debug for FunctionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionVersion")
            .field("id", &self.id.qualified_arn())
            .field("runtime", &self.runtime)
            .field("internal_revision", &self.internal_revision)
            .finish_non_exhaustive()
    }
}
