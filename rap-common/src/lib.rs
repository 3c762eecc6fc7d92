//! Shared types used across RAP components.
//!
//! This crate is the leaf of the workspace: execution options and strategy
//! types, the proxy configuration, content digests, and the path arithmetic
//! needed to describe an action identically to the local host and to a
//! remote execution service.

pub mod digest;
pub mod paths;
pub mod types;

pub use digest::Digest;
pub use types::{
    ActionLabels, ExecutionStrategy, LocalExecutionOptions, ProxyConfig, RemoteExecutionOptions,
};
