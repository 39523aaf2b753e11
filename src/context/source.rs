//! Context sources

use std::path::PathBuf;

use async_trait::async_trait;

use super::{ContextRequest, ContextSource};
use crate::Result;

/// Reads enhanced context from a text file on every assembly
#[derive(Debug, Clone)]
pub struct FileContextSource {
    path: PathBuf,
}

impl FileContextSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContextSource for FileContextSource {
    async fn assemble(&self, request: &ContextRequest) -> Result<String> {
        let body = tokio::fs::read_to_string(&self.path).await?;
        tracing::debug!(
            path = %self.path.display(),
            phase = %request.phase,
            bytes = body.len(),
            "loaded context file"
        );
        Ok(body)
    }
}

/// Fixed context body
#[derive(Debug, Clone)]
pub struct StaticContext(pub String);

#[async_trait]
impl ContextSource for StaticContext {
    async fn assemble(&self, _request: &ContextRequest) -> Result<String> {
        Ok(self.0.clone())
    }
}
