//! Remote execution client seam.
//!
//! The transport is not this crate's business; the engine only needs the
//! capability set below. A context is created once per action and reused
//! across cache lookup, execution, download and cache update.

use crate::action::CommandSpec;
use crate::record::RemoteMetadata;
use crate::result::CommandResult;
use crate::sink::OutputSink;
use async_trait::async_trait;
use rap_common::{Digest, RemoteExecutionOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to create execution context: {0}")]
    Context(String),
    #[error("remote call failed: {0}")]
    Rpc(String),
}

/// One node of the flattened remote output tree, path relative to the
/// working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNode {
    pub path: String,
    pub digest: Digest,
}

/// Client for a content-addressable remote execution service.
#[async_trait]
pub trait RemoteExecClient: Send + Sync {
    async fn new_context(
        &self,
        cmd: &CommandSpec,
        opts: &RemoteExecutionOptions,
        sink: OutputSink,
    ) -> Result<Arc<dyn ExecutionContext>, RemoteError>;
}

/// Opaque per-action handle holding the most recent result and metadata.
///
/// Result contract:
/// - [`get_cached_result`](Self::get_cached_result) stores a cache-hit
///   result, or leaves the result unset on a miss;
/// - [`execute_remotely`](Self::execute_remotely) always executes and
///   replaces the stored result;
/// - [`download_outputs`](Self::download_outputs) and
///   [`download_specified_outputs`](Self::download_specified_outputs) leave
///   the stored result unchanged on success and replace it with a
///   remote-error result on failure, so download failure is detected by
///   re-reading [`result`](Self::result) after the call;
/// - [`update_cached_result`](Self::update_cached_result) refreshes the
///   metadata (and stores an error result if the upload fails).
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    async fn get_cached_result(&self);
    async fn execute_remotely(&self);
    /// Download all outputs of the current result under `dir`.
    async fn download_outputs(&self, dir: &Path);
    /// Download only `outs` under `dir`.
    async fn download_specified_outputs(&self, outs: &[OutputNode], dir: &Path);
    /// Flattened output tree of the current result.
    fn flattened_outputs(&self) -> Result<Vec<OutputNode>, RemoteError>;
    /// Digests of the declared output files after execution, keyed by path
    /// relative to the working directory.
    fn output_file_digests(&self) -> Result<HashMap<String, Digest>, RemoteError>;
    /// Publish the local result and outputs as the cached result.
    async fn update_cached_result(&self);
    fn result(&self) -> Option<CommandResult>;
    fn metadata(&self) -> RemoteMetadata;
}
