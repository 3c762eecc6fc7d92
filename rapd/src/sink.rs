//! Captured stdout/stderr for an action.

use std::sync::{Arc, Mutex};

/// Recording sink for a command's stdout and stderr. Cloning shares the
/// underlying buffers, so a race arm can write while the coordinator keeps a
/// handle for the final record.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_out(&self, data: &[u8]) {
        self.stdout.lock().unwrap().extend_from_slice(data);
    }

    pub fn write_err(&self, data: &[u8]) {
        self.stderr.lock().unwrap().extend_from_slice(data);
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.lock().unwrap().clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.lock().unwrap().clone()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout()).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr()).into_owned()
    }

    /// True when the sink shares buffers with `other` (same allocation).
    pub fn shares_buffers_with(&self, other: &OutputSink) -> bool {
        Arc::ptr_eq(&self.stdout, &other.stdout)
    }
}
