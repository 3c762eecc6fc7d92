//! The execution engine.
//!
//! One engine serves the whole proxy: it owns the collaborator handles, the
//! shared fallback counter and the proxy configuration, and runs each action
//! with its selected strategy. Exactly one result is assigned to every
//! action before `run_action` returns.

use crate::action::{Action, CommandSpec};
use crate::deps::DepsParser;
use crate::fmc::FileMetadataCache;
use crate::forecast::Forecast;
use crate::inputs::InputProcessor;
use crate::local::LocalPool;
use crate::record::EVENT_PROXY_EXECUTION;
use crate::remote::RemoteExecClient;
use crate::result::CommandResult;
use crate::scope::CancelScope;
use chrono::Utc;
use rap_common::{ActionLabels, ExecutionStrategy, ProxyConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Engine {
    remote: Arc<dyn RemoteExecClient>,
    pool: Arc<dyn LocalPool>,
    inputs: Arc<dyn InputProcessor>,
    deps: Arc<dyn DepsParser>,
    fmc: Arc<dyn FileMetadataCache>,
    forecast: Arc<Forecast>,
    cfg: ProxyConfig,
    num_fallbacks: AtomicU64,
}

impl Engine {
    pub fn new(
        remote: Arc<dyn RemoteExecClient>,
        pool: Arc<dyn LocalPool>,
        inputs: Arc<dyn InputProcessor>,
        deps: Arc<dyn DepsParser>,
        fmc: Arc<dyn FileMetadataCache>,
        forecast: Arc<Forecast>,
        cfg: ProxyConfig,
    ) -> Self {
        Self {
            remote,
            pool,
            inputs,
            deps,
            fmc,
            forecast,
            cfg,
            num_fallbacks: AtomicU64::new(0),
        }
    }

    /// Build an action seeded with this engine's configuration.
    pub fn new_action(&self, cmd: CommandSpec, labels: ActionLabels) -> Action {
        let mut action = Action::new(
            cmd,
            labels,
            Arc::clone(&self.fmc),
            Arc::clone(&self.forecast),
        );
        action.racing_tmp = self.cfg.racing_tmp.clone();
        action.racing_bias = self.cfg.clamped_bias();
        action.compare = self.cfg.compare;
        action.num_local_reruns = self.cfg.num_local_reruns;
        action.num_remote_reruns = self.cfg.num_remote_reruns;
        action
    }

    /// Times local execution succeeded after the remote attempt failed or
    /// was abandoned.
    pub fn num_fallbacks(&self) -> u64 {
        self.num_fallbacks.load(Ordering::Relaxed)
    }

    pub fn forecast(&self) -> &Arc<Forecast> {
        &self.forecast
    }

    /// Independent copies of an action for comparison reruns: one per local
    /// rerun, one per remote rerun, plus the original run.
    pub fn duplicate_for_compare(&self, action: &Action) -> Vec<Action> {
        let n = action.num_local_reruns + action.num_remote_reruns + 1;
        action.duplicate(n as usize)
    }

    /// Execute `action` with its selected strategy.
    pub async fn run_action(&self, action: &mut Action, parent: &CancelScope) {
        let from = Utc::now();
        match self.cfg.action_timeout() {
            Some(bound) => {
                if tokio::time::timeout(bound, self.execute(action, parent))
                    .await
                    .is_err()
                {
                    warn!(
                        execution_id = %action.cmd.identifiers.execution_id,
                        "action exceeded its {:?} bound",
                        bound
                    );
                    action.set_result(CommandResult::timeout(format!(
                        "action exceeded {:?}",
                        bound
                    )));
                }
            }
            None => self.execute(action, parent).await,
        }
        if action.result().is_none() {
            action.set_result(CommandResult::local_error(
                "action completed without a result",
            ));
        }
        action.rec.completion_status = action.result().map(|r| r.status);
        action.rec.record_event_time(EVENT_PROXY_EXECUTION, from);
    }

    async fn execute(&self, action: &mut Action, parent: &CancelScope) {
        if action.populate_command_io(&*self.inputs).await.is_err() {
            return;
        }
        action.add_deps_file_output();
        debug!(
            execution_id = %action.cmd.identifiers.execution_id,
            strategy = %action.exec_strategy,
            "executing action"
        );
        match action.exec_strategy {
            ExecutionStrategy::Remote => {
                action.run_remote(&*self.remote, &*self.deps).await;
            }
            ExecutionStrategy::Local => {
                action.run_local(&*self.pool, parent).await;
                self.publish_local_result(action).await;
            }
            ExecutionStrategy::RemoteLocalFallback => {
                action.run_remote(&*self.remote, &*self.deps).await;
                if !action.result().is_some_and(CommandResult::is_ok) {
                    debug!(
                        execution_id = %action.cmd.identifiers.execution_id,
                        "remote attempt failed, falling back to local"
                    );
                    action.run_local(&*self.pool, parent).await;
                    self.num_fallbacks.fetch_add(1, Ordering::Relaxed);
                    action.cache_local(&*self.deps).await;
                }
            }
            ExecutionStrategy::Racing => {
                action
                    .race(
                        parent,
                        &self.remote,
                        &self.pool,
                        &*self.deps,
                        &self.num_fallbacks,
                        self.cfg.max_holdoff(),
                    )
                    .await;
                if action.rec.local_metadata.executed_locally {
                    action.cache_local(&*self.deps).await;
                }
            }
        }
    }

    /// Upload a local result to the remote cache, creating an execution
    /// context if the action does not have one yet. Failures never affect
    /// the action's result.
    async fn publish_local_result(&self, action: &mut Action) {
        if !action.result().is_some_and(CommandResult::is_ok) || action.local_opts.do_not_cache {
            return;
        }
        if let Err(e) = action.create_exec_context(&*self.remote).await {
            warn!(
                execution_id = %action.cmd.identifiers.execution_id,
                "cannot create execution context to update remote cache: {}",
                e
            );
            return;
        }
        action.cache_local(&*self.deps).await;
    }
}
