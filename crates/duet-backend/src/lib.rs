//! Agent CLI plumbing shared by the gateway and the worker: backend
//! definitions, the subprocess runner, output classification and the
//! stream tee used for every child process we read from.

pub mod backend;
pub mod classify;
pub mod runner;
pub mod tee;

pub use backend::Backend;
pub use runner::{CliOutput, CliRunner, ProcessRunner};
