//! RAP execution engine.
//!
//! Each build action entering the proxy is executed remotely against a
//! content-addressable execution service, locally on the host, or both at
//! once in a race that uses the first usable result. The racing coordinator
//! keeps the losing remote attempt running on a detached scope so the remote
//! cache still gets populated, and holds off local starts on cache hits
//! based on a forecast of download latency.
//!
//! The engine consumes its collaborators (remote client, local pool, input
//! processor, deps parser, file-metadata cache) through traits; see
//! [`engine::Engine`] for the entry point.

pub mod action;
pub mod deps;
pub mod engine;
pub mod fmc;
pub mod forecast;
pub mod inputs;
pub mod local;
pub mod race;
pub mod record;
pub mod remote;
pub mod result;
pub mod scope;
pub mod sink;
pub mod staging;
pub mod stash;
pub mod testing;

pub use action::{Action, CommandSpec};
pub use engine::Engine;
pub use result::{CommandResult, ResultStatus};
pub use scope::CancelScope;
