//! Dependency-file parser seam.
//!
//! Shallow input inference is not hermetic: a remote cache hit is only
//! trustworthy if the dependency file it was computed from still matches
//! the current input digests. Writing and verifying that side-file is the
//! parser's job; the engine only decides when to call it.

use crate::record::LogRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DepsError {
    #[error("failed to write deps file {path}: {reason}")]
    Write { path: String, reason: String },
    #[error("failed to verify deps file {path}: {reason}")]
    Verify { path: String, reason: String },
}

#[async_trait]
pub trait DepsParser: Send + Sync {
    /// Write (or refresh) the `.deps` side-file for `dfile`.
    async fn write_deps_file(&self, dfile: &str, rec: &mut LogRecord) -> Result<(), DepsError>;

    /// Verify the recorded dependency digests for `dfile` against current
    /// inputs. `Ok(false)` means the file parsed but no longer matches.
    async fn verify_deps_file(&self, dfile: &str, rec: &mut LogRecord)
        -> Result<bool, DepsError>;
}
