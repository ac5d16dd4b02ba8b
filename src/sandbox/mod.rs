//! Sandboxed execution of a single command under resource limits.
//!
//! This module runs one child process rooted in a prepared workspace and
//! reports measured resource usage. It handles:
//! - rlimit enforcement and I/O redirection at spawn time
//! - a wall-clock and memory watchdog
//! - rusage-based CPU/system time accounting
//!
//! The sandbox does NOT:
//! - classify outcomes (that's the executor's job)
//! - stage or collect files (workspace contents are the caller's)
//!
//! Limit violations are not errors: they show up in [`ExecutionInfo`] and
//! are classified downstream. Only setup failures (cannot redirect, cannot
//! spawn) are reported as [`SetupError`].

mod unix;

pub use unix::UnixSandbox;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("sandbox setup failed: {0}")]
pub struct SetupError(pub String);

/// Settings for one sandboxed command.
///
/// Zero means "no limit" for every limit field. Times are milliseconds,
/// sizes KiB.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Directory the process runs in; the only tree it should touch.
    pub root: PathBuf,
    /// Executable path relative to `root`.
    pub executable: String,
    pub args: Vec<String>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
    pub cpu_limit_ms: u64,
    pub wall_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub max_files: u32,
    pub max_procs: u32,
    pub max_file_size_kb: u64,
    pub max_mlock_kb: u64,
    pub max_stack_kb: u64,
}

impl ExecutionOptions {
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
            ..Self::default()
        }
    }
}

/// Measurements and termination status of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInfo {
    pub cpu_time_ms: u64,
    pub sys_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    /// Exit code, or 0 when the process was killed by a signal.
    pub status_code: i32,
    /// Terminating signal, or 0 on a normal exit.
    pub signal: i32,
    pub message: String,
}

pub trait Sandbox: Send + Sync {
    /// Runs the command and waits for it. See the module docs for the
    /// error model.
    fn execute(&self, options: &ExecutionOptions) -> Result<ExecutionInfo, SetupError>;

    /// Marks a staged input read-only.
    fn make_immutable(&self, path: &Path) -> Result<(), SetupError>;

    /// Marks the main executable runnable.
    ///
    /// Must be called before `execute` when the executable came out of the
    /// content store, and must be exclusive with hardlink creation on the
    /// path: a concurrent link can otherwise flip mode bits on the stored
    /// artifact after linking.
    fn prepare_for_execution(&self, path: &Path) -> Result<(), SetupError>;
}

/// The sandbox implementation for this platform.
pub fn create() -> Arc<dyn Sandbox> {
    Arc::new(UnixSandbox::new())
}
