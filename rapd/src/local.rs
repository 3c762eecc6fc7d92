//! Local execution pool.
//!
//! Bounded pool of host processes. Cancellation is only honored while an
//! action is still queued: once a process has been spawned it is writing to
//! the execution root and must run to completion.

use crate::action::CommandSpec;
use crate::record::{LogRecord, EVENT_LOCAL_COMMAND_EXECUTION};
use crate::scope::CancelScope;
use crate::sink::OutputSink;
use async_trait::async_trait;
use chrono::Utc;
use rap_common::ActionLabels;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The action was canceled before a process was started. Guaranteed:
    /// this error is never returned once a process has begun executing.
    #[error("local execution canceled before start")]
    Canceled,
    #[error("failed to run local command: {0}")]
    Spawn(String),
}

#[async_trait]
pub trait LocalPool: Send + Sync {
    /// Run `cmd` on the host, streaming stdout/stderr into `sink` and
    /// recording the execution interval on `rec`. A non-zero exit code is
    /// returned as `Ok`.
    async fn run(
        &self,
        parent: &CancelScope,
        cancel: &CancelScope,
        cmd: &CommandSpec,
        labels: &ActionLabels,
        sink: &OutputSink,
        rec: &mut LogRecord,
    ) -> Result<i32, PoolError>;
}

/// Semaphore-bounded pool over host processes.
pub struct ProcessPool {
    slots: Arc<Semaphore>,
}

impl ProcessPool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
        }
    }
}

#[async_trait]
impl LocalPool for ProcessPool {
    async fn run(
        &self,
        parent: &CancelScope,
        cancel: &CancelScope,
        cmd: &CommandSpec,
        labels: &ActionLabels,
        sink: &OutputSink,
        rec: &mut LogRecord,
    ) -> Result<i32, PoolError> {
        let _permit = tokio::select! {
            permit = self.slots.acquire() => {
                permit.map_err(|e| PoolError::Spawn(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(PoolError::Canceled),
            _ = parent.cancelled() => return Err(PoolError::Canceled),
        };
        if parent.is_cancelled() || cancel.is_cancelled() {
            return Err(PoolError::Canceled);
        }

        let (program, args) = cmd
            .args
            .split_first()
            .ok_or_else(|| PoolError::Spawn("empty argv".to_string()))?;
        debug!(
            execution_id = %cmd.identifiers.execution_id,
            labels = %labels,
            "executing locally: {}",
            cmd.args.join(" ")
        );

        let from = Utc::now();
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(cmd.abs_working_dir())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for kv in &cmd.environment {
            if let Some((k, v)) = kv.split_once('=') {
                command.env(k, v);
            }
        }
        let child = command
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", program, e)))?;

        // The process is running: from here on cancellation is ignored.
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        sink.write_out(&output.stdout);
        sink.write_err(&output.stderr);
        rec.record_event_time(EVENT_LOCAL_COMMAND_EXECUTION, from);

        Ok(exit_code(&output.status))
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
