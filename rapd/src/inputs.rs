//! Input processor seam.
//!
//! Input discovery (header scanning, deps inference) lives outside this
//! crate. The engine hands the processor a command description and receives
//! the final input specification plus any outputs the processor inferred.

use crate::record::LogRecord;
use async_trait::async_trait;
use rap_common::{ActionLabels, ExecutionStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Files (relative to the execution root) a command reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub inputs: Vec<String>,
}

#[derive(Debug, Error)]
#[error("processing inputs failed: {0}")]
pub struct InputError(pub String);

/// Request handed to the input processor.
#[derive(Debug, Clone)]
pub struct ProcessInputsOptions {
    pub execution_id: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub exec_root: PathBuf,
    pub inputs: InputSpec,
    pub labels: ActionLabels,
    pub toolchain_inputs: Vec<String>,
    pub windows_cross: bool,
    pub exec_strategy: ExecutionStrategy,
    pub environment: Vec<String>,
}

/// What the processor determined about the command.
#[derive(Debug, Clone, Default)]
pub struct ProcessedInputs {
    pub input_spec: InputSpec,
    /// Additional output files inferred from the command, relative to the
    /// execution root.
    pub output_files: Vec<String>,
    /// Additional output directories inferred from the command, relative to
    /// the execution root.
    pub output_directories: Vec<String>,
    /// Inputs were inferred without a full preprocess; cache hits need
    /// deps-file verification before they can be trusted.
    pub used_shallow_mode: bool,
    /// Dependency file the command emits, when known.
    pub emitted_dependency_file: Option<String>,
}

#[async_trait]
pub trait InputProcessor: Send + Sync {
    async fn process_inputs(
        &self,
        options: ProcessInputsOptions,
        rec: &mut LogRecord,
    ) -> Result<ProcessedInputs, InputError>;
}
