//! Scriptable collaborator fakes for engine and race tests.
//!
//! Kept in `src` (not `tests/`) so unit tests across the crate can share
//! them. Each fake is scripted up front and records what happened to it, so
//! tests can assert on both the action's state and the collaborator's.

use crate::action::CommandSpec;
use crate::deps::{DepsError, DepsParser};
use crate::inputs::{InputError, InputProcessor, InputSpec, ProcessInputsOptions, ProcessedInputs};
use crate::local::{LocalPool, PoolError};
use crate::record::{LogRecord, RemoteMetadata, EVENT_LOCAL_COMMAND_EXECUTION};
use crate::remote::{ExecutionContext, OutputNode, RemoteError, RemoteExecClient};
use crate::result::CommandResult;
use crate::scope::CancelScope;
use crate::sink::OutputSink;
use async_trait::async_trait;
use chrono::Utc;
use rap_common::{ActionLabels, Digest, RemoteExecutionOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Remote execution ─────────────────────────────────────────────────────

/// Script for one fake execution context.
#[derive(Debug, Clone)]
pub struct RemoteScript {
    /// Result of the cache lookup; `None` is a cache miss.
    pub cached_result: Option<CommandResult>,
    /// Result of `execute_remotely`.
    pub exec_result: CommandResult,
    pub exec_delay: Duration,
    pub download_delay: Duration,
    /// When set, downloads fail with this message instead of writing files.
    pub download_error: Option<String>,
    /// Files written on download, relative to the working directory.
    pub outputs: Vec<(String, Vec<u8>)>,
    /// Post-execution digests of the declared output files.
    pub output_digests: HashMap<String, Digest>,
    /// Flattened output tree returned by `flattened_outputs`.
    pub flattened: Vec<OutputNode>,
    /// When set, `update_cached_result` fails with this message.
    pub update_error: Option<String>,
    pub action_digest: String,
}

impl Default for RemoteScript {
    fn default() -> Self {
        Self {
            cached_result: None,
            exec_result: CommandResult::from_exit_code(0),
            exec_delay: Duration::ZERO,
            download_delay: Duration::ZERO,
            download_error: None,
            outputs: Vec::new(),
            output_digests: HashMap::new(),
            flattened: Vec::new(),
            update_error: None,
            action_digest: "fake-digest/0".to_string(),
        }
    }
}

impl RemoteScript {
    pub fn cache_hit() -> Self {
        Self {
            cached_result: Some(CommandResult::cache_hit(0)),
            ..Self::default()
        }
    }

    pub fn cache_miss() -> Self {
        Self::default()
    }
}

/// Fake [`ExecutionContext`] driven by a [`RemoteScript`].
pub struct FakeExecutionContext {
    script: RemoteScript,
    working_dir: String,
    result: Mutex<Option<CommandResult>>,
    metadata: Mutex<RemoteMetadata>,
    executed: AtomicBool,
    downloaded: AtomicBool,
    cache_updated: AtomicBool,
    downloaded_paths: Mutex<Vec<String>>,
}

impl FakeExecutionContext {
    pub fn new(script: RemoteScript, working_dir: impl Into<String>) -> Self {
        let metadata = RemoteMetadata {
            action_digest: script.action_digest.clone(),
            ..Default::default()
        };
        Self {
            script,
            working_dir: working_dir.into(),
            result: Mutex::new(None),
            metadata: Mutex::new(metadata),
            executed: AtomicBool::new(false),
            downloaded: AtomicBool::new(false),
            cache_updated: AtomicBool::new(false),
            downloaded_paths: Mutex::new(Vec::new()),
        }
    }

    /// Context that only answers `output_file_digests`.
    pub fn with_output_digests(output_digests: HashMap<String, Digest>) -> Self {
        Self::new(
            RemoteScript {
                output_digests,
                ..Default::default()
            },
            "",
        )
    }

    pub fn was_executed(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn was_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn cache_was_updated(&self) -> bool {
        self.cache_updated.load(Ordering::SeqCst)
    }

    pub fn downloaded_paths(&self) -> Vec<String> {
        self.downloaded_paths.lock().unwrap().clone()
    }

    fn stage_dir(&self, dir: &Path) -> std::path::PathBuf {
        if self.working_dir.is_empty() {
            dir.to_path_buf()
        } else {
            dir.join(&self.working_dir)
        }
    }

    fn write_output(&self, dir: &Path, rel: &str, data: &[u8]) {
        let path = self.stage_dir(dir).join(rel);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&path, data).expect("fake download write");
        self.downloaded_paths.lock().unwrap().push(rel.to_string());
    }
}

#[async_trait]
impl ExecutionContext for FakeExecutionContext {
    async fn get_cached_result(&self) {
        if let Some(res) = &self.script.cached_result {
            *self.result.lock().unwrap() = Some(res.clone());
            self.metadata.lock().unwrap().cache_hit = true;
        }
    }

    async fn execute_remotely(&self) {
        tokio::time::sleep(self.script.exec_delay).await;
        self.executed.store(true, Ordering::SeqCst);
        *self.result.lock().unwrap() = Some(self.script.exec_result.clone());
    }

    async fn download_outputs(&self, dir: &Path) {
        tokio::time::sleep(self.script.download_delay).await;
        if let Some(err) = &self.script.download_error {
            *self.result.lock().unwrap() = Some(CommandResult::remote_error(err.clone()));
            return;
        }
        for (rel, data) in &self.script.outputs {
            self.write_output(dir, rel, data);
        }
        self.downloaded.store(true, Ordering::SeqCst);
    }

    async fn download_specified_outputs(&self, outs: &[OutputNode], dir: &Path) {
        tokio::time::sleep(self.script.download_delay).await;
        if let Some(err) = &self.script.download_error {
            *self.result.lock().unwrap() = Some(CommandResult::remote_error(err.clone()));
            return;
        }
        for node in outs {
            if let Some((rel, data)) = self.script.outputs.iter().find(|(p, _)| *p == node.path) {
                self.write_output(dir, rel, data);
            }
        }
        self.downloaded.store(true, Ordering::SeqCst);
    }

    fn flattened_outputs(&self) -> Result<Vec<OutputNode>, RemoteError> {
        Ok(self.script.flattened.clone())
    }

    fn output_file_digests(&self) -> Result<HashMap<String, Digest>, RemoteError> {
        Ok(self.script.output_digests.clone())
    }

    async fn update_cached_result(&self) {
        if let Some(err) = &self.script.update_error {
            *self.result.lock().unwrap() = Some(CommandResult::remote_error(err.clone()));
            return;
        }
        self.cache_updated.store(true, Ordering::SeqCst);
    }

    fn result(&self) -> Option<CommandResult> {
        self.result.lock().unwrap().clone()
    }

    fn metadata(&self) -> RemoteMetadata {
        self.metadata.lock().unwrap().clone()
    }
}

/// Fake remote client producing one scripted context per `new_context` call.
pub struct FakeRemoteClient {
    script: RemoteScript,
    /// When set, context creation fails with this message.
    pub fail_context: Option<String>,
    contexts: Mutex<Vec<Arc<FakeExecutionContext>>>,
}

impl FakeRemoteClient {
    pub fn new(script: RemoteScript) -> Self {
        Self {
            script,
            fail_context: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_context(message: impl Into<String>) -> Self {
        Self {
            script: RemoteScript::default(),
            fail_context: Some(message.into()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// The most recently created context.
    pub fn last_context(&self) -> Option<Arc<FakeExecutionContext>> {
        self.contexts.lock().unwrap().last().cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecClient for FakeRemoteClient {
    async fn new_context(
        &self,
        cmd: &CommandSpec,
        _opts: &RemoteExecutionOptions,
        _sink: OutputSink,
    ) -> Result<Arc<dyn ExecutionContext>, RemoteError> {
        if let Some(message) = &self.fail_context {
            return Err(RemoteError::Context(message.clone()));
        }
        let ec = Arc::new(FakeExecutionContext::new(
            self.script.clone(),
            cmd.working_dir.clone(),
        ));
        self.contexts.lock().unwrap().push(Arc::clone(&ec));
        Ok(ec)
    }
}

// ── Local pool ───────────────────────────────────────────────────────────

/// Fake [`LocalPool`] with separate cancellable queue and uncancellable run
/// phases, mirroring the real pool's guarantee that cancellation is ignored
/// once a process starts.
pub struct FakeLocalPool {
    pub queue_delay: Duration,
    pub run_duration: Duration,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl FakeLocalPool {
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            queue_delay: Duration::ZERO,
            run_duration: Duration::ZERO,
            exit_code,
            stdout: Vec::new(),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_queue_delay(mut self, queue_delay: Duration) -> Self {
        self.queue_delay = queue_delay;
        self
    }

    pub fn with_run_duration(mut self, run_duration: Duration) -> Self {
        self.run_duration = run_duration;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// How many processes actually began executing.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalPool for FakeLocalPool {
    async fn run(
        &self,
        parent: &CancelScope,
        cancel: &CancelScope,
        _cmd: &CommandSpec,
        _labels: &ActionLabels,
        sink: &OutputSink,
        rec: &mut LogRecord,
    ) -> Result<i32, PoolError> {
        tokio::select! {
            _ = tokio::time::sleep(self.queue_delay) => {}
            _ = cancel.cancelled() => return Err(PoolError::Canceled),
            _ = parent.cancelled() => return Err(PoolError::Canceled),
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        let from = Utc::now();
        tokio::time::sleep(self.run_duration).await;
        sink.write_out(&self.stdout);
        rec.record_event_time(EVENT_LOCAL_COMMAND_EXECUTION, from);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(self.exit_code)
    }
}

// ── Input processor ──────────────────────────────────────────────────────

/// Fake [`InputProcessor`]. By default it echoes the inputs it was given and
/// adds nothing.
#[derive(Debug, Clone, Default)]
pub struct FakeInputProcessor {
    inputs: Option<Vec<String>>,
    output_files: Vec<String>,
    output_directories: Vec<String>,
    shallow_deps: Option<String>,
    fail: Option<String>,
}

impl FakeInputProcessor {
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_output_files(mut self, output_files: Vec<String>) -> Self {
        self.output_files = output_files;
        self
    }

    pub fn with_output_dirs(mut self, output_directories: Vec<String>) -> Self {
        self.output_directories = output_directories;
        self
    }

    /// Report shallow-mode inference emitting `dfile`.
    pub fn with_shallow_deps(mut self, dfile: impl Into<String>) -> Self {
        self.shallow_deps = Some(dfile.into());
        self
    }
}

#[async_trait]
impl InputProcessor for FakeInputProcessor {
    async fn process_inputs(
        &self,
        options: ProcessInputsOptions,
        _rec: &mut LogRecord,
    ) -> Result<ProcessedInputs, InputError> {
        if let Some(message) = &self.fail {
            return Err(InputError(message.clone()));
        }
        Ok(ProcessedInputs {
            input_spec: InputSpec {
                inputs: self.inputs.clone().unwrap_or(options.inputs.inputs),
            },
            output_files: self.output_files.clone(),
            output_directories: self.output_directories.clone(),
            used_shallow_mode: self.shallow_deps.is_some(),
            emitted_dependency_file: self.shallow_deps.clone(),
        })
    }
}

// ── Deps parser ──────────────────────────────────────────────────────────

/// Fake [`DepsParser`] recording writes and answering verifications with a
/// fixed verdict.
pub struct FakeDepsParser {
    verify_ok: bool,
    verify_error: Option<String>,
    write_error: Option<String>,
    written: Mutex<Vec<String>>,
}

impl FakeDepsParser {
    pub fn verifying(verify_ok: bool) -> Self {
        Self {
            verify_ok,
            verify_error: None,
            write_error: None,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_verify(message: impl Into<String>) -> Self {
        Self {
            verify_ok: false,
            verify_error: Some(message.into()),
            write_error: None,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_write(message: impl Into<String>) -> Self {
        Self {
            verify_ok: true,
            verify_error: None,
            write_error: Some(message.into()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn written_files(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl DepsParser for FakeDepsParser {
    async fn write_deps_file(&self, dfile: &str, _rec: &mut LogRecord) -> Result<(), DepsError> {
        if let Some(reason) = &self.write_error {
            return Err(DepsError::Write {
                path: dfile.to_string(),
                reason: reason.clone(),
            });
        }
        self.written.lock().unwrap().push(dfile.to_string());
        Ok(())
    }

    async fn verify_deps_file(
        &self,
        dfile: &str,
        _rec: &mut LogRecord,
    ) -> Result<bool, DepsError> {
        if let Some(reason) = &self.verify_error {
            return Err(DepsError::Verify {
                path: dfile.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self.verify_ok)
    }
}
