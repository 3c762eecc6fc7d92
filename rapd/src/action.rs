//! Actions and their lifecycle.
//!
//! An action wraps one command with everything the proxy tracks about it:
//! options, labels, the mutable log record, the captured output, and the
//! derived state computed while executing (execution context, deps file,
//! result). The racing coordinator in [`crate::race`] and the staging
//! helpers in [`crate::staging`] are implemented as further `impl Action`
//! blocks.

use crate::deps::{DepsError, DepsParser};
use crate::fmc::FileMetadataCache;
use crate::forecast::Forecast;
use crate::inputs::{InputError, InputProcessor, InputSpec, ProcessInputsOptions};
use crate::local::{LocalPool, PoolError};
use crate::record::{
    LogRecord, TimeInterval, EVENT_DEPS_VALIDATION, EVENT_INPUT_PROCESSING,
    EVENT_PROXY_EXECUTION, EVENT_REMOTE_COMMAND_EXECUTION,
};
use crate::remote::{ExecutionContext, RemoteExecClient};
use crate::result::CommandResult;
use crate::scope::CancelScope;
use crate::sink::OutputSink;
use crate::stash::{self, Stash};
use chrono::Utc;
use rap_common::{
    paths, ActionLabels, ExecutionStrategy, LocalExecutionOptions, RemoteExecutionOptions,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Suffix of the side-file holding recorded dependency digests.
pub const DEPS_FILE_SUFFIX: &str = ".deps";

/// Identifiers attached to one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandIdentifiers {
    pub execution_id: String,
    pub command_id: String,
    pub invocation_id: String,
}

impl CommandIdentifiers {
    pub fn generate() -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            command_id: uuid::Uuid::new_v4().to_string(),
            invocation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Immutable description of the command to run. Populated once, then only
/// adjusted by input processing.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub identifiers: CommandIdentifiers,
    /// Top-level directory from which paths in the command are resolved.
    pub exec_root: PathBuf,
    /// Caller-provided working directory, relative to the execution root.
    pub working_dir: String,
    /// Canonical same-depth path used on remote workers.
    pub remote_working_dir: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs for the command's environment.
    pub environment: Vec<String>,
    pub input_spec: InputSpec,
    /// Declared output files, relative to the working directory after input
    /// processing.
    pub output_files: Vec<String>,
    /// Declared output directories, relative to the working directory after
    /// input processing.
    pub output_dirs: Vec<String>,
}

impl CommandSpec {
    /// Absolute working directory of the command.
    pub fn abs_working_dir(&self) -> PathBuf {
        if self.working_dir.is_empty() {
            self.exec_root.clone()
        } else {
            self.exec_root.join(&self.working_dir)
        }
    }

    /// Copy of this command with `wrapper` prepended to argv, when set.
    pub(crate) fn with_wrapper(&self, wrapper: Option<&str>) -> CommandSpec {
        match wrapper {
            None | Some("") => self.clone(),
            Some(w) => {
                let mut cmd = self.clone();
                cmd.args = std::iter::once(w.to_string())
                    .chain(self.args.iter().cloned())
                    .collect();
                cmd
            }
        }
    }
}

/// One unit of work: a command to execute remotely, locally, or both.
pub struct Action {
    pub cmd: CommandSpec,
    pub labels: ActionLabels,
    pub toolchain_inputs: Vec<String>,
    pub remote_opts: RemoteExecutionOptions,
    pub local_opts: LocalExecutionOptions,
    pub exec_strategy: ExecutionStrategy,
    pub compare: bool,
    pub num_local_reruns: u32,
    pub num_remote_reruns: u32,
    /// Speed/bandwidth bias in [0, 1] for the racing holdoff.
    pub racing_bias: f64,
    /// Cross-compiling for Windows from a POSIX host.
    pub windows_cross: bool,
    /// Root for this action's racing scratch directory.
    pub racing_tmp: PathBuf,
    pub oe: OutputSink,
    pub rec: LogRecord,
    pub fmc: Arc<dyn FileMetadataCache>,
    pub forecast: Arc<Forecast>,

    // Derived while executing.
    pub(crate) exec_context: Option<Arc<dyn ExecutionContext>>,
    pub(crate) dfile: Option<String>,
    pub(crate) deps_file: Option<String>,
    pub(crate) res: Option<CommandResult>,
    pub(crate) action_digest: String,
    raw_in_out_files: Option<Vec<PathBuf>>,
}

impl Action {
    pub fn new(
        cmd: CommandSpec,
        labels: ActionLabels,
        fmc: Arc<dyn FileMetadataCache>,
        forecast: Arc<Forecast>,
    ) -> Self {
        let mut rec = LogRecord::new();
        rec.local_metadata.labels = labels
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rec.local_metadata.environment = cmd.environment.clone();
        Self {
            cmd,
            labels,
            toolchain_inputs: Vec::new(),
            remote_opts: RemoteExecutionOptions::default(),
            local_opts: LocalExecutionOptions::default(),
            exec_strategy: ExecutionStrategy::default(),
            compare: false,
            num_local_reruns: 0,
            num_remote_reruns: 0,
            racing_bias: 0.5,
            windows_cross: false,
            racing_tmp: std::env::temp_dir().join("rap-racing"),
            oe: OutputSink::new(),
            rec,
            fmc,
            forecast,
            exec_context: None,
            dfile: None,
            deps_file: None,
            res: None,
            action_digest: String::new(),
            raw_in_out_files: None,
        }
    }

    pub fn result(&self) -> Option<&CommandResult> {
        self.res.as_ref()
    }

    /// Hash of the remote action, once known.
    pub fn action_digest(&self) -> &str {
        &self.action_digest
    }

    pub fn exec_context(&self) -> Option<&Arc<dyn ExecutionContext>> {
        self.exec_context.as_ref()
    }

    pub(crate) fn set_result(&mut self, res: CommandResult) {
        self.res = Some(res);
    }

    /// Path of the deps side-file, when the action runs in shallow mode.
    pub fn deps_file(&self) -> Option<&str> {
        self.deps_file.as_deref()
    }

    // ── Input processing ─────────────────────────────────────────────────

    /// Run the input processor and fold its findings into the command:
    /// final input spec, merged and deduplicated outputs re-expressed
    /// relative to the working directory, slash normalization for Windows
    /// cross builds, and the deps side-file for shallow-mode actions.
    pub async fn populate_command_io(
        &mut self,
        ip: &dyn InputProcessor,
    ) -> Result<(), InputError> {
        let from = Utc::now();
        let options = ProcessInputsOptions {
            execution_id: self.cmd.identifiers.execution_id.clone(),
            cmd: self.cmd.args.clone(),
            working_dir: self.cmd.working_dir.clone(),
            exec_root: self.cmd.exec_root.clone(),
            inputs: self.cmd.input_spec.clone(),
            labels: self.labels.clone(),
            toolchain_inputs: self.toolchain_inputs.clone(),
            windows_cross: self.windows_cross,
            exec_strategy: self.exec_strategy,
            environment: self.cmd.environment.clone(),
        };
        let processed = match ip.process_inputs(options, &mut self.rec).await {
            Ok(p) => p,
            Err(e) => {
                self.set_result(CommandResult::local_error(format!(
                    "{}: {}",
                    self.cmd.identifiers.execution_id, e
                )));
                return Err(e);
            }
        };
        self.rec.record_event_time(EVENT_INPUT_PROCESSING, from);

        self.cmd.input_spec = processed.input_spec;
        let mut files = std::mem::take(&mut self.cmd.output_files);
        files.extend(processed.output_files);
        self.cmd.output_files = paths::rel_to_working_dir(
            &self.cmd.exec_root,
            &self.cmd.working_dir,
            &paths::dedup(files),
        );
        let mut dirs = std::mem::take(&mut self.cmd.output_dirs);
        dirs.extend(processed.output_directories);
        self.cmd.output_dirs = paths::rel_to_working_dir(
            &self.cmd.exec_root,
            &self.cmd.working_dir,
            &paths::dedup(dirs),
        );
        if self.windows_cross {
            self.cmd.working_dir = paths::to_slash(&self.cmd.working_dir);
            self.cmd.remote_working_dir = paths::to_slash(&self.cmd.remote_working_dir);
            for p in &mut self.cmd.output_files {
                *p = paths::to_slash(p);
            }
            for p in &mut self.cmd.output_dirs {
                *p = paths::to_slash(p);
            }
        }
        if processed.used_shallow_mode {
            // Shallow-inferred inputs are not hermetic; keep the dependency
            // file around for cache-hit validation.
            if let Some(dfile) = processed.emitted_dependency_file {
                if !dfile.is_empty() {
                    self.deps_file = Some(format!("{dfile}{DEPS_FILE_SUFFIX}"));
                    self.dfile = Some(dfile);
                }
            }
        }
        debug!(
            execution_id = %self.cmd.identifiers.execution_id,
            inputs = self.cmd.input_spec.inputs.len(),
            outputs = self.cmd.output_files.len() + self.cmd.output_dirs.len(),
            "processed inputs"
        );
        Ok(())
    }

    /// Declare the deps side-file as an additional output.
    pub fn add_deps_file_output(&mut self) {
        if let Some(deps_file) = &self.deps_file {
            self.cmd.output_files.push(deps_file.clone());
        }
    }

    // ── Remote cache interaction ─────────────────────────────────────────

    pub async fn create_exec_context(
        &mut self,
        client: &dyn RemoteExecClient,
    ) -> Result<(), crate::remote::RemoteError> {
        if self.exec_context.is_some() {
            return Ok(());
        }
        let ec = client
            .new_context(&self.cmd, &self.remote_opts, self.oe.clone())
            .await?;
        self.exec_context = Some(ec);
        Ok(())
    }

    /// Look up the cached remote result and adopt it if valid. Shallow-mode
    /// hits must pass deps-file verification before they count.
    pub async fn get_cached_result(&mut self, parser: &dyn DepsParser) {
        let Some(ec) = self.exec_context.clone() else {
            warn!(
                execution_id = %self.cmd.identifiers.execution_id,
                "no execution context"
            );
            return;
        };
        ec.get_cached_result().await;
        let res = ec.result();
        let mut meta = ec.metadata();
        self.action_digest = meta.action_digest.clone();
        meta.result = res.clone();
        self.rec.remote_metadata = Some(meta);
        self.res = res.clone();
        let Some(res) = res else { return };
        if !res.is_ok() {
            return;
        }
        if let Some(rm) = &mut self.rec.remote_metadata {
            rm.cache_hit = true;
        }
        if !self.cached_result_valid(parser).await {
            self.set_result(CommandResult::local_error(format!(
                "{} failed deps validation",
                self.cmd.identifiers.execution_id
            )));
            return;
        }
        self.rec.local_metadata.valid_cache_hit = true;
    }

    /// Whether a cached result may be trusted. Non-shallow actions always
    /// pass; shallow ones verify the deps side-file.
    pub async fn cached_result_valid(&mut self, parser: &dyn DepsParser) -> bool {
        debug!(
            execution_id = %self.cmd.identifiers.execution_id,
            "found cached result"
        );
        let Some(dfile) = self.dfile.clone() else {
            return true;
        };
        let from = Utc::now();
        let ok = match parser.verify_deps_file(&dfile, &mut self.rec).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to verify deps file: {}",
                    e
                );
                false
            }
        };
        self.rec.record_event_time(EVENT_DEPS_VALIDATION, from);
        ok
    }

    /// Publish an ok local result to the remote cache: refresh the deps
    /// file, drop stale metadata cache entries for every output, upload,
    /// and fold the post-update metadata into the record while keeping the
    /// result and cache-hit flag from the local attempt.
    pub async fn cache_local(&mut self, parser: &dyn DepsParser) {
        let Some(ec) = self.exec_context.clone() else {
            warn!(
                execution_id = %self.cmd.identifiers.execution_id,
                "no execution context"
            );
            return;
        };
        if !self.res.as_ref().is_some_and(CommandResult::is_ok) || self.local_opts.do_not_cache {
            return;
        }
        if let Err(e) = self.generate_deps_file(parser).await {
            warn!(
                execution_id = %self.cmd.identifiers.execution_id,
                "failed to generate deps file: {}",
                e
            );
            return;
        }
        // The local run may have changed output contents; cached digests
        // must not leak into the upload.
        self.clear_outputs_cache();
        let from = Utc::now();
        ec.update_cached_result().await;
        self.rec
            .record_event_time(crate::record::EVENT_UPDATE_CACHED_RESULT, from);
        if let Some(res) = ec.result() {
            if !res.is_ok() {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed updating remote cache: {:?}",
                    res
                );
                return;
            }
        }
        let prior = self.rec.remote_metadata.take();
        let mut meta = ec.metadata();
        if let Some(prior) = prior {
            meta.result = prior.result;
            meta.cache_hit = prior.cache_hit;
        }
        self.rec.remote_metadata = Some(meta);
        self.rec.local_metadata.updated_cache = true;
    }

    pub async fn generate_deps_file(&mut self, parser: &dyn DepsParser) -> Result<(), DepsError> {
        if let Some(dfile) = self.dfile.clone() {
            parser.write_deps_file(&dfile, &mut self.rec).await?;
        }
        Ok(())
    }

    // ── Non-race execution paths ─────────────────────────────────────────

    /// Execute locally through the pool, with the local wrapper applied.
    pub async fn run_local(&mut self, pool: &dyn LocalPool, scope: &CancelScope) {
        let cmd = self.cmd.with_wrapper(self.local_opts.wrapper.as_deref());
        let labels = self.labels.clone();
        let sink = self.oe.clone();
        let res = match pool
            .run(scope, scope, &cmd, &labels, &sink, &mut self.rec)
            .await
        {
            Ok(exit_code) => {
                self.rec.local_metadata.executed_locally = true;
                CommandResult::from_exit_code(exit_code)
            }
            Err(PoolError::Canceled) => CommandResult::interrupted(scope.cause()),
            Err(PoolError::Spawn(e)) => CommandResult::local_error(e),
        };
        self.rec.local_metadata.result = Some(res.clone());
        self.set_result(res);
    }

    /// Execute remotely (or adopt a validated cache hit), downloading only
    /// changed outputs when unchanged-output mtimes are preserved.
    pub async fn run_remote(&mut self, client: &dyn RemoteExecClient, parser: &dyn DepsParser) {
        let mut opts = self.remote_opts.clone();
        let exclude_unchanged = opts.download_outputs && opts.preserve_unchanged_output_mtime;
        if exclude_unchanged {
            // Only changed outputs are downloaded, explicitly, below.
            opts.download_outputs = false;
        }
        let cmd = self.cmd.with_wrapper(opts.wrapper.as_deref());
        let ec = match client.new_context(&cmd, &opts, self.oe.clone()).await {
            Ok(ec) => ec,
            Err(e) => {
                let res = CommandResult::local_error(e.to_string());
                self.rec.remote_metadata = Some(crate::record::RemoteMetadata {
                    result: Some(res.clone()),
                    ..Default::default()
                });
                self.set_result(res);
                return;
            }
        };
        self.exec_context = Some(ec.clone());

        if opts.accept_cached {
            ec.get_cached_result().await;
        }
        let adopt_cached = match ec.result() {
            Some(res) if res.is_ok() => self.cached_result_valid(parser).await,
            _ => false,
        };
        if adopt_cached {
            self.rec.local_metadata.valid_cache_hit = true;
        } else {
            let from = Utc::now();
            ec.execute_remotely().await;
            self.rec
                .record_event_time(EVENT_REMOTE_COMMAND_EXECUTION, from);
        }

        let res = ec
            .result()
            .unwrap_or_else(|| CommandResult::remote_error("remote attempt produced no result"));
        let mut meta = ec.metadata();
        self.action_digest = meta.action_digest.clone();
        meta.result = Some(res.clone());
        meta.cache_hit = meta.cache_hit || adopt_cached;
        self.rec.remote_metadata = Some(meta);
        self.set_result(res.clone());

        if res.is_ok() && exclude_unchanged {
            let outs = match ec.flattened_outputs() {
                Ok(outs) => outs,
                Err(e) => {
                    error!(
                        execution_id = %self.cmd.identifiers.execution_id,
                        "unable to get flattened outputs from action result: {}",
                        e
                    );
                    return;
                }
            };
            let exec_root = self.cmd.exec_root.clone();
            let outs = self.exclude_unchanged_outputs(outs, &exec_root);
            ec.download_specified_outputs(&outs, &exec_root).await;
        }
    }

    // ── Output cache maintenance ─────────────────────────────────────────

    /// Drop file-metadata cache entries for every declared output file and
    /// every file inside every declared output directory.
    pub fn clear_outputs_cache(&self) {
        for path in self.output_file_list() {
            if let Err(e) = self.fmc.delete(&path) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to delete cache entry of {} while clearing output cache: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    // ── Compare mode ─────────────────────────────────────────────────────

    /// Delete every declared output (sparing the deps side-file) so a rerun
    /// starts clean. Output directories are recreated with their original
    /// permission bits so local runs still find them.
    pub fn remove_all_outputs(&self) {
        let base = self.cmd.abs_working_dir();
        for f in &self.cmd.output_files {
            if Some(f.as_str()) == self.deps_file.as_deref() {
                continue;
            }
            let path = base.join(f);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to remove file {}: {}",
                    path.display(),
                    e
                );
            }
        }
        for d in &self.cmd.output_dirs {
            let path = base.join(d);
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(
                        execution_id = %self.cmd.identifiers.execution_id,
                        "failed to stat directory {}: {}",
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to remove directory {}: {}",
                    path.display(),
                    e
                );
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&path)
                .and_then(|()| std::fs::set_permissions(&path, meta.permissions()))
            {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "cannot recreate directory {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    /// Absolute paths of files present in both the input and output sets,
    /// computed once. These are rewritten in place by every run and must be
    /// stashed around reruns.
    pub fn in_out_files(&mut self) -> &[PathBuf] {
        if self.raw_in_out_files.is_none() {
            let inputs: HashSet<&str> = self
                .cmd
                .input_spec
                .inputs
                .iter()
                .map(String::as_str)
                .collect();
            let rel = paths::rel_to_exec_root(
                &self.cmd.exec_root,
                &self.cmd.working_dir,
                &self.cmd.output_files,
            );
            let found = rel
                .into_iter()
                .filter(|f| inputs.contains(f.as_str()))
                .map(|f| self.cmd.exec_root.join(f))
                .collect();
            self.raw_in_out_files = Some(found);
        }
        self.raw_in_out_files.as_deref().unwrap()
    }

    pub fn stash_input_output_files(&mut self) -> Stash {
        let files = self.in_out_files().to_vec();
        stash::stash_files(&files)
    }

    /// Restore stashed in-and-out files and drop their metadata cache
    /// entries: the rerun may have rewritten them.
    pub fn restore_input_output_files(&mut self, stash: Stash) {
        stash.restore();
        self.clear_input_output_file_cache();
    }

    pub fn clear_input_output_file_cache(&mut self) {
        let files = self.in_out_files().to_vec();
        for path in files {
            if let Err(e) = self.fmc.delete(&path) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to delete cache entry of {} while restoring in/out files: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    /// Deep copies of this action for comparison reruns. Each duplicate
    /// gets its own log record (seeded with a fresh proxy-execution start
    /// and the parent's environment and labels) and its own output sink, so
    /// mutating one duplicate never shows up in another.
    pub fn duplicate(&self, n: usize) -> Vec<Action> {
        (0..n)
            .map(|_| {
                let mut rec = LogRecord::new();
                rec.event_times.insert(
                    EVENT_PROXY_EXECUTION.to_string(),
                    TimeInterval::starting(Utc::now()),
                );
                rec.local_metadata.environment = self.rec.local_metadata.environment.clone();
                rec.local_metadata.labels = self.rec.local_metadata.labels.clone();
                Action {
                    cmd: self.cmd.clone(),
                    labels: self.labels.clone(),
                    toolchain_inputs: self.toolchain_inputs.clone(),
                    remote_opts: self.remote_opts.clone(),
                    local_opts: self.local_opts.clone(),
                    exec_strategy: self.exec_strategy,
                    compare: self.compare,
                    num_local_reruns: self.num_local_reruns,
                    num_remote_reruns: self.num_remote_reruns,
                    racing_bias: self.racing_bias,
                    windows_cross: self.windows_cross,
                    racing_tmp: self.racing_tmp.clone(),
                    oe: OutputSink::new(),
                    rec,
                    fmc: Arc::clone(&self.fmc),
                    forecast: Arc::clone(&self.forecast),
                    exec_context: self.exec_context.clone(),
                    dfile: self.dfile.clone(),
                    deps_file: self.deps_file.clone(),
                    res: self.res.clone(),
                    action_digest: self.action_digest.clone(),
                    raw_in_out_files: None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmc::MemoryFileMetadataCache;
    use crate::testing::{FakeDepsParser, FakeInputProcessor};
    use tempfile::TempDir;

    fn test_action(dir: &TempDir) -> Action {
        let cmd = CommandSpec {
            identifiers: CommandIdentifiers::generate(),
            exec_root: dir.path().to_path_buf(),
            working_dir: "out".to_string(),
            remote_working_dir: paths::to_remote_working_dir("out"),
            args: vec!["cc".to_string(), "-c".to_string(), "main.c".to_string()],
            environment: vec!["PATH=/usr/bin".to_string()],
            input_spec: InputSpec {
                inputs: vec!["main.c".to_string()],
            },
            output_files: vec!["out/main.o".to_string()],
            output_dirs: vec![],
        };
        let labels: ActionLabels = [("type", "compile")].into_iter().collect();
        Action::new(
            cmd,
            labels,
            Arc::new(MemoryFileMetadataCache::new()),
            Arc::new(Forecast::default()),
        )
    }

    #[tokio::test]
    async fn test_populate_command_io_merges_and_dedups_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        let ip = FakeInputProcessor::default()
            .with_inputs(vec!["main.c".to_string(), "main.h".to_string()])
            .with_output_files(vec!["out/main.o".to_string(), "out/main.d".to_string()]);
        action.populate_command_io(&ip).await.unwrap();

        assert_eq!(action.cmd.input_spec.inputs, vec!["main.c", "main.h"]);
        // Relative to the working directory, duplicates collapsed.
        assert_eq!(action.cmd.output_files, vec!["main.o", "main.d"]);
        assert!(action.rec.event_times.contains_key(EVENT_INPUT_PROCESSING));
    }

    #[tokio::test]
    async fn test_populate_command_io_failure_sets_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        let ip = FakeInputProcessor::failing("header scan failed");
        assert!(action.populate_command_io(&ip).await.is_err());
        let res = action.result().expect("result should be set");
        assert_eq!(res.status, crate::result::ResultStatus::LocalError);
    }

    #[tokio::test]
    async fn test_shallow_mode_stores_deps_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        let ip = FakeInputProcessor::default().with_shallow_deps("main.d");
        action.populate_command_io(&ip).await.unwrap();
        assert_eq!(action.deps_file(), Some("main.d.deps"));

        action.add_deps_file_output();
        assert!(action.cmd.output_files.contains(&"main.d.deps".to_string()));
    }

    #[tokio::test]
    async fn test_windows_cross_normalizes_separators() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        action.windows_cross = true;
        action.cmd.working_dir = "out\\debug".to_string();
        action.cmd.remote_working_dir = "set_by_reclient\\a".to_string();
        action.cmd.output_files = vec!["out\\debug\\main.obj".to_string()];
        let ip = FakeInputProcessor::default();
        action.populate_command_io(&ip).await.unwrap();

        assert_eq!(action.cmd.working_dir, "out/debug");
        assert_eq!(action.cmd.remote_working_dir, "set_by_reclient/a");
        assert!(action
            .cmd
            .output_files
            .iter()
            .all(|p| !p.contains('\\')), "{:?}", action.cmd.output_files);
    }

    #[tokio::test]
    async fn test_cached_result_valid_without_deps_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        let parser = FakeDepsParser::verifying(false);
        // No deps file recorded: validation is not required.
        assert!(action.cached_result_valid(&parser).await);
    }

    #[tokio::test]
    async fn test_cached_result_invalid_when_verification_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        action.dfile = Some("main.d".to_string());
        let parser = FakeDepsParser::verifying(false);
        assert!(!action.cached_result_valid(&parser).await);
        let parser = FakeDepsParser::verifying(true);
        assert!(action.cached_result_valid(&parser).await);
    }

    #[test]
    fn test_in_out_files_is_input_output_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = test_action(&dir);
        action.cmd.input_spec.inputs =
            vec!["out/gen.h".to_string(), "main.c".to_string()];
        action.cmd.output_files = vec!["gen.h".to_string(), "main.o".to_string()];
        let in_out = action.in_out_files().to_vec();
        assert_eq!(in_out, vec![dir.path().join("out/gen.h")]);
        // Lazily computed once.
        action.cmd.output_files.clear();
        assert_eq!(action.in_out_files().to_vec(), in_out);
    }

    #[test]
    fn test_remove_all_outputs_spares_deps_file_and_recreates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let wd = dir.path().join("out");
        std::fs::create_dir_all(wd.join("gen")).unwrap();
        std::fs::write(wd.join("main.o"), b"obj").unwrap();
        std::fs::write(wd.join("main.d.deps"), b"deps").unwrap();
        std::fs::write(wd.join("gen/g.h"), b"hdr").unwrap();

        let mut action = test_action(&dir);
        action.deps_file = Some("main.d.deps".to_string());
        action.cmd.output_files =
            vec!["main.o".to_string(), "main.d.deps".to_string()];
        action.cmd.output_dirs = vec!["gen".to_string()];
        action.remove_all_outputs();

        assert!(!wd.join("main.o").exists());
        assert!(wd.join("main.d.deps").exists());
        assert!(wd.join("gen").is_dir());
        assert!(!wd.join("gen/g.h").exists());
    }

    #[tokio::test]
    async fn test_duplicates_are_mutation_independent() {
        let dir = tempfile::tempdir().unwrap();
        let action = test_action(&dir);
        let mut dups = action.duplicate(3);
        assert_eq!(dups.len(), 3);

        dups[0].rec.local_metadata.executed_locally = true;
        dups[0].oe.write_out(b"first only");
        dups[0].remote_opts.preserve_unchanged_output_mtime = true;
        dups[0].cmd.output_files.push("extra.o".to_string());

        assert!(!dups[1].rec.local_metadata.executed_locally);
        assert!(dups[1].oe.stdout().is_empty());
        assert!(!dups[1].remote_opts.preserve_unchanged_output_mtime);
        assert_eq!(dups[1].cmd.output_files, action.cmd.output_files);
        assert!(!action.rec.local_metadata.executed_locally);
        assert!(!dups[0].oe.shares_buffers_with(&dups[1].oe));
        assert!(!dups[0].oe.shares_buffers_with(&action.oe));
    }

    #[test]
    fn test_duplicate_zero_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let action = test_action(&dir);
        assert!(action.duplicate(0).is_empty());
    }

    #[test]
    fn test_duplicate_seeds_proxy_execution_start() {
        let dir = tempfile::tempdir().unwrap();
        let action = test_action(&dir);
        let dups = action.duplicate(1);
        let interval = &dups[0].rec.event_times[EVENT_PROXY_EXECUTION];
        assert!(interval.to.is_none());
        assert_eq!(
            dups[0].rec.local_metadata.labels,
            action.rec.local_metadata.labels
        );
    }

    #[test]
    fn test_with_wrapper_prepends_argv() {
        let dir = tempfile::tempdir().unwrap();
        let action = test_action(&dir);
        let wrapped = action.cmd.with_wrapper(Some("ccache"));
        assert_eq!(wrapped.args[0], "ccache");
        assert_eq!(&wrapped.args[1..], &action.cmd.args[..]);
        let unwrapped = action.cmd.with_wrapper(None);
        assert_eq!(unwrapped.args, action.cmd.args);
    }
}
