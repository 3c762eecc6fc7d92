//! The execution race.
//!
//! A racing action drives a remote attempt and a gated local attempt
//! concurrently and uses the first usable result. The remote attempt runs on
//! a detached scope so it completes even when local wins, keeping the remote
//! cache warm for future builds. On a cache hit the local start is held off
//! by a forecast of the download latency, scaled by the racing bias.

use crate::action::{Action, CommandSpec};
use crate::deps::DepsParser;
use crate::forecast::{Forecast, DOWNLOAD_PERCENTILE_CUTOFF};
use crate::local::{LocalPool, PoolError};
use crate::record::{LogRecord, EVENT_RACING_FINALIZATION_OVERHEAD};
use crate::remote::{ExecutionContext, RemoteExecClient};
use crate::result::CommandResult;
use crate::scope::CancelScope;
use crate::sink::OutputSink;
use chrono::Utc;
use rap_common::{ActionLabels, RemoteExecutionOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Which race arm produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Remote,
    Local,
    Canceled,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Outcome of one race arm.
struct RaceOutcome {
    kind: OutcomeKind,
    result: Option<CommandResult>,
    sink: Option<OutputSink>,
    /// Private record of the local arm, folded into the action's record
    /// when local wins.
    record: Option<LogRecord>,
}

impl RaceOutcome {
    fn canceled() -> Self {
        Self {
            kind: OutcomeKind::Canceled,
            result: None,
            sink: None,
            record: None,
        }
    }

    fn canceled_with(result: CommandResult, sink: Option<OutputSink>) -> Self {
        Self {
            kind: OutcomeKind::Canceled,
            result: Some(result),
            sink,
            record: None,
        }
    }
}

/// Local-start delay for a cache hit. Bias 0.5 is neutral (multiplier 1.0);
/// bias toward speed (1.0) doubles the holdoff so the download is more
/// likely to finish first; bias toward bandwidth (0.0) starts local
/// immediately. Clamped to `max_holdoff`.
pub(crate) fn holdoff_duration(
    download_latency: Duration,
    racing_bias: f64,
    max_holdoff: Duration,
) -> Duration {
    let ms = download_latency.as_millis() as f64 * (racing_bias * 2.0);
    Duration::from_millis(ms as u64).min(max_holdoff)
}

impl Action {
    /// Race a remote attempt against a gated local attempt and finalize the
    /// winner's outputs and metadata on this action.
    pub async fn race(
        &mut self,
        parent: &CancelScope,
        client: &Arc<dyn RemoteExecClient>,
        pool: &Arc<dyn LocalPool>,
        parser: &dyn DepsParser,
        num_fallbacks: &AtomicU64,
        max_holdoff: Duration,
    ) {
        let sibling = parent.child();

        // Digests and mtimes of outputs already on disk, for restoring
        // unchanged mtimes after a remote win.
        let pre_exec_outs = self
            .remote_opts
            .preserve_unchanged_output_mtime
            .then(|| self.pre_exec_outs_info());

        let scratch = match self.create_scratch_dir() {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "could not create scratch directory for remote output: {}",
                    e
                );
                self.set_result(CommandResult::local_error(e.to_string()));
                return;
            }
        };

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<RaceOutcome>(2);
        let (start_local_tx, start_local_rx) = oneshot::channel::<()>();
        let (ec_tx, mut ec_rx) = oneshot::channel::<Arc<dyn ExecutionContext>>();

        // Remote arm. Detached scope: the remote request must run to
        // completion even if local wins, so future builds get cache hits.
        {
            let detached = CancelScope::detached_from(parent);
            let tx = outcome_tx.clone();
            let client = Arc::clone(client);
            let cmd = self.cmd.with_wrapper(self.remote_opts.wrapper.as_deref());
            let mut opts = self.remote_opts.clone();
            // Outputs go to the scratch directory, not the execution root.
            opts.download_outputs = false;
            let forecast = Arc::clone(&self.forecast);
            let labels = self.labels.clone();
            let racing_bias = self.racing_bias;
            let sibling = sibling.clone();
            let tmp_dir = scratch.path().to_path_buf();
            tokio::spawn(async move {
                let outcome = run_remote_race(
                    detached,
                    sibling,
                    client,
                    cmd,
                    opts,
                    forecast,
                    labels,
                    racing_bias,
                    start_local_tx,
                    ec_tx,
                    tmp_dir,
                    max_holdoff,
                )
                .await;
                let _ = tx.send(outcome).await;
            });
        }

        // Local arm, gated on the start signal. A dropped gate means the
        // race was already decided.
        {
            let tx = outcome_tx.clone();
            let pool = Arc::clone(pool);
            let cmd = self.cmd.clone();
            let labels = self.labels.clone();
            let parent = parent.clone();
            let sibling = sibling.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    started = start_local_rx => match started {
                        Ok(()) => run_local_race(parent, sibling, pool, cmd, labels).await,
                        Err(_) => RaceOutcome::canceled(),
                    },
                    _ = sibling.cancelled() => RaceOutcome::canceled(),
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(outcome_tx);

        let mut winner = tokio::select! {
            outcome = outcome_rx.recv() => outcome.unwrap_or_else(RaceOutcome::canceled),
            _ = parent.cancelled() => {
                self.set_result(CommandResult::interrupted(parent.cause()));
                return;
            }
        };
        if winner.kind != OutcomeKind::Canceled {
            // Abort the other arm. Local is only aborted while still
            // queued; once a process runs it cannot be stopped. A canceled
            // first outcome means the remote attempt bailed out before
            // starting, and local must keep going.
            sibling.cancel(format!("{} won the race", winner.kind));
            debug!(
                execution_id = %self.cmd.identifiers.execution_id,
                "canceled sibling after {} won",
                winner.kind
            );
        }

        if let Some(gate) = parent.hooks().block_fallback.clone() {
            gate.passed().await;
        }

        if winner.kind != OutcomeKind::Local {
            // Remote won: wait for local to finish or cancel; a local
            // process that already started wins any contest, its effects
            // are on disk. First outcome canceled: wait for the real
            // winner.
            tokio::select! {
                second = outcome_rx.recv() => {
                    if let Some(second) = second {
                        if second.kind == OutcomeKind::Local {
                            if winner.kind == OutcomeKind::Canceled {
                                num_fallbacks.fetch_add(1, Ordering::Relaxed);
                            }
                            winner = second;
                        }
                    }
                }
                _ = parent.cancelled() => {
                    self.set_result(CommandResult::interrupted(parent.cause()));
                    return;
                }
            }
        }

        if let Ok(ec) = ec_rx.try_recv() {
            self.exec_context = Some(ec);
        }

        let from = Utc::now();
        match winner.kind {
            OutcomeKind::Remote => {
                debug!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "using remote result"
                );
                let cache_hit = self
                    .exec_context
                    .as_ref()
                    .is_some_and(|ec| ec.metadata().cache_hit);
                if cache_hit && !self.cached_result_valid(parser).await {
                    // A shallow-mode cache hit is only usable after deps
                    // verification; the staged outputs stay out of the
                    // execution root.
                    self.set_result(CommandResult::local_error(format!(
                        "{} failed deps validation",
                        self.cmd.identifiers.execution_id
                    )));
                    self.rec
                        .record_event_time(EVENT_RACING_FINALIZATION_OVERHEAD, from);
                    return;
                }
                if let Err(e) = self.move_outputs_from_temp(scratch.path()) {
                    self.set_result(CommandResult::local_error(e.to_string()));
                    return;
                }
                if let Some(pre) = &pre_exec_outs {
                    if let Err(e) = self.restore_unchanged_output_mtimes(pre) {
                        error!(
                            execution_id = %self.cmd.identifiers.execution_id,
                            "was unable to restore mtimes for unchanged outputs: {}",
                            e
                        );
                    }
                }
                if let Some(ec) = &self.exec_context {
                    let mut meta = ec.metadata();
                    self.action_digest = meta.action_digest.clone();
                    meta.result = winner.result.clone();
                    self.rec.remote_metadata = Some(meta);
                }
                self.res = winner.result.clone();
            }
            OutcomeKind::Local => {
                debug!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "using local result"
                );
                self.rec.local_metadata.executed_locally = true;
                if let Some(record) = &winner.record {
                    self.rec.copy_event_times_from(record);
                }
                self.rec.local_metadata.result = winner.result.clone();
                self.res = winner.result.clone();
            }
            OutcomeKind::Canceled => {
                debug!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "both local and remote were canceled"
                );
                if winner.result.is_some() {
                    self.res = winner.result.clone();
                }
            }
        }
        self.rec
            .record_event_time(EVENT_RACING_FINALIZATION_OVERHEAD, from);
        if let Some(sink) = winner.sink {
            self.oe = sink;
        }
    }
}

/// The remote arm of the race. `start_local` releases the local arm: on a
/// cache miss immediately, on a cache hit after the forecast-driven holdoff.
#[allow(clippy::too_many_arguments)]
async fn run_remote_race(
    detached: CancelScope,
    sibling: CancelScope,
    client: Arc<dyn RemoteExecClient>,
    cmd: CommandSpec,
    opts: RemoteExecutionOptions,
    forecast: Arc<Forecast>,
    labels: ActionLabels,
    racing_bias: f64,
    start_local: oneshot::Sender<()>,
    ec_tx: oneshot::Sender<Arc<dyn ExecutionContext>>,
    tmp_dir: PathBuf,
    max_holdoff: Duration,
) -> RaceOutcome {
    let execution_id = cmd.identifiers.execution_id.clone();
    let sink = OutputSink::new();
    let ec = match client.new_context(&cmd, &opts, sink.clone()).await {
        Ok(ec) => ec,
        Err(e) => {
            warn!(%execution_id, "failed to create execution context: {}", e);
            let _ = start_local.send(());
            return RaceOutcome::canceled_with(CommandResult::local_error(e.to_string()), None);
        }
    };
    let _ = ec_tx.send(Arc::clone(&ec));

    ec.get_cached_result().await;
    let mut cache_hit = false;
    match ec.result() {
        None => {
            // Cache miss: local starts now, remote executes. The race is on.
            debug!(%execution_id, "cache miss, starting race");
            let _ = start_local.send(());
            ec.execute_remotely().await;
            debug!(%execution_id, "executed remotely: {:?}", ec.result());
            if sibling.is_cancelled() {
                // Local already completed; outputs are no longer needed.
                return RaceOutcome::canceled();
            }
        }
        Some(_) => {
            cache_hit = true;
            // Cache hit: hold local off while the download runs. The timer
            // is gated on the sibling scope so it never outlives the race.
            let forecast = Arc::clone(&forecast);
            let labels = labels.clone();
            let sibling = sibling.clone();
            let execution_id = execution_id.clone();
            tokio::spawn(async move {
                let latency = match forecast
                    .percentile_download_latency(&labels, DOWNLOAD_PERCENTILE_CUTOFF)
                {
                    Ok(latency) => latency,
                    Err(e) => {
                        warn!(
                            %execution_id,
                            "failed to get download latency prediction: {}", e
                        );
                        max_holdoff
                    }
                };
                let holdoff = holdoff_duration(latency, racing_bias, max_holdoff);
                tokio::select! {
                    _ = tokio::time::sleep(holdoff) => {
                        debug!(
                            %execution_id,
                            "holdoff of {:?} done, signaling local execution", holdoff
                        );
                        let _ = start_local.send(());
                    }
                    _ = sibling.cancelled() => {}
                }
            });
        }
    }

    // Read the result before downloading; a failed download replaces the
    // stored result, a successful one leaves it alone.
    let res = match ec.result() {
        Some(res) => res,
        None => {
            return RaceOutcome::canceled_with(
                CommandResult::remote_error("remote attempt produced no result"),
                Some(sink),
            )
        }
    };
    if !res.is_ok() {
        warn!(
            %execution_id,
            "remote execution failed with {:?}, waiting for local", res
        );
        warn!(
            %execution_id,
            "stdout: {} stderr: {}",
            sink.stdout_string(),
            sink.stderr_string()
        );
        return RaceOutcome::canceled_with(res, Some(sink));
    }

    debug!(
        %execution_id,
        "downloading action outputs to scratch dir {}",
        tmp_dir.display()
    );
    let download_started = Instant::now();
    ec.download_outputs(&tmp_dir).await;
    if sibling.is_cancelled() {
        // Local already completed; outputs are no longer needed.
        return RaceOutcome::canceled();
    }
    match ec.result() {
        Some(res) if res.is_ok() => {
            if cache_hit {
                forecast.record_download_latency(&labels, download_started.elapsed());
            }
        }
        res => {
            // Download failed.
            let failure =
                res.unwrap_or_else(|| CommandResult::remote_error("download produced no result"));
            return RaceOutcome::canceled_with(failure, Some(sink));
        }
    }

    if let Some(gate) = detached.hooks().block_remote_result.clone() {
        gate.passed().await;
    }
    RaceOutcome {
        kind: OutcomeKind::Remote,
        result: ec.result(),
        sink: Some(sink),
        record: None,
    }
}

/// The local arm of the race. Once the pool reports that a process actually
/// ran, its result is used regardless of remote execution: the process has
/// already written to the execution root.
async fn run_local_race(
    parent: CancelScope,
    sibling: CancelScope,
    pool: Arc<dyn LocalPool>,
    cmd: CommandSpec,
    labels: ActionLabels,
) -> RaceOutcome {
    debug!(
        execution_id = %cmd.identifiers.execution_id,
        "running local"
    );
    let mut record = LogRecord::new();
    let sink = OutputSink::new();
    match pool
        .run(&parent, &sibling, &cmd, &labels, &sink, &mut record)
        .await
    {
        Err(PoolError::Canceled) => RaceOutcome::canceled(),
        Err(PoolError::Spawn(e)) => {
            RaceOutcome::canceled_with(CommandResult::local_error(e), None)
        }
        Ok(exit_code) => RaceOutcome {
            kind: OutcomeKind::Local,
            result: Some(CommandResult::from_exit_code(exit_code)),
            sink: Some(sink),
            record: Some(record),
        },
    }
}
