//! Cancellation scopes.
//!
//! A [`CancelScope`] pairs a cancellation token with a human-readable cause
//! so that an interrupted action can report why it was interrupted. Scopes
//! form a tree: `child` inherits cancellation from its parent, while
//! `detached_from` starts a fresh root that only carries over the race test
//! gates — a detached remote attempt must keep running when its siblings are
//! canceled.

use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A barrier a test can hold closed to pause an execution path at a
/// designated point. Production scopes carry no gates and never pause.
#[derive(Debug, Clone)]
pub struct Gate {
    rx: watch::Receiver<bool>,
}

/// Opens an associated [`Gate`]. Dropping the control without opening also
/// releases waiters, so a forgotten gate cannot hang the engine.
#[derive(Debug)]
pub struct GateControl {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> (GateControl, Gate) {
        let (tx, rx) = watch::channel(false);
        (GateControl { tx }, Gate { rx })
    }

    /// Wait until the gate is opened (or its control dropped).
    pub async fn passed(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl GateControl {
    pub fn open(&self) {
        let _ = self.tx.send(true);
    }
}

/// Testing-only pause points threaded through scopes.
#[derive(Debug, Clone, Default)]
pub struct RaceTestHooks {
    /// Holds the remote race arm just before it reports a remote win.
    pub block_remote_result: Option<Gate>,
    /// Holds the race coordinator between winner selection and draining the
    /// second result.
    pub block_fallback: Option<Gate>,
}

/// Cancellation token plus cause, with test hooks carried as scope values.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    cause: Arc<OnceLock<String>>,
    hooks: RaceTestHooks,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hooks(hooks: RaceTestHooks) -> Self {
        Self {
            hooks,
            ..Self::default()
        }
    }

    /// Child scope: canceled when this scope is canceled, but cancelable on
    /// its own without affecting the parent. Shares the test hooks.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            hooks: self.hooks.clone(),
        }
    }

    /// New root scope that does NOT inherit cancellation from `parent` but
    /// explicitly forwards its test hooks.
    pub fn detached_from(parent: &CancelScope) -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            hooks: parent.hooks.clone(),
        }
    }

    /// Cancel this scope (and its children). The first cause wins.
    pub fn cancel(&self, cause: impl Into<String>) {
        let _ = self.cause.set(cause.into());
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded cause, or a generic one when canceled through a parent.
    pub fn cause(&self) -> String {
        self.cause
            .get()
            .cloned()
            .unwrap_or_else(|| "scope canceled".to_string())
    }

    pub fn hooks(&self) -> &RaceTestHooks {
        &self.hooks
    }
}
