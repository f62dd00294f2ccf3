//! Process isolation for untrusted code execution.
//!
//! Exposes a single [`Sandbox`] capability set (`compile`/`execute`)
//! implemented by two variants: [`secure::SecureSandbox`], which runs
//! code inside a disposable `runc` container, and [`local::LocalSandbox`],
//! which runs the host toolchain directly for development. Dispatch
//! between the two is a configuration flag, not an inheritance hierarchy.

pub mod local;
pub mod secure;
pub mod workspace;

use std::time::Duration;

use async_trait::async_trait;
use oj_shared::ProgrammingLanguage;
use serde::{Deserialize, Serialize};

pub use workspace::Workspace;

/// Resource limits for a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecLimits {
    pub max_time: Duration,
    pub max_memory_bytes: u64,
}

impl ExecLimits {
    pub fn new(max_time: Duration, max_memory_bytes: u64) -> Self {
        Self {
            max_time,
            max_memory_bytes,
        }
    }

    /// cpu-time ulimit applied in isolated mode: `ceil(max_time) + 1s`.
    pub fn cpu_time_ulimit(&self) -> Duration {
        let secs = self.max_time.as_secs_f64().ceil() as u64;
        Duration::from_secs(secs + 1)
    }
}

/// Hard cap applied to every compile invocation, regardless of language.
pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a compile call, distinct from the process's own exit code:
/// the sandbox always returns captured output, never panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    Ok,
    CompileFailed { details: String },
}

/// Outcome of an execute call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecResult {
    Ok,
    RuntimeError { details: String },
    TimedOut,
    Oom,
    StartFailed { details: String },
}

/// The result of a compile invocation: combined stdout+stderr plus the
/// typed outcome.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub compile_output: String,
    pub result: CompileResult,
}

/// The result of an execute invocation. `stdout` may be non-empty even
/// when `result != Ok` — a timed-out or crashing process can still have
/// written partial output before being terminated.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub stdout: Vec<u8>,
    pub elapsed: Duration,
    pub memory_estimate_bytes: u64,
    pub result: ExecResult,
}

/// Infrastructure-level sandbox failures: never a panic, always a typed
/// value surfaced through [`CompileResult`]/[`ExecResult`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

/// The capability set shared by every sandbox variant.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Compiles `code` for `language`. Must tear down all temporary
    /// state before returning, on every exit path.
    async fn compile(
        &self,
        language: ProgrammingLanguage,
        code: &[u8],
    ) -> Result<CompileOutcome, SandboxError>;

    /// Executes `code` for `language` against `input`, bounded by
    /// `limits`. The timeout is enforced from the caller's wall clock,
    /// not the target process's self-report.
    async fn execute(
        &self,
        language: ProgrammingLanguage,
        code: &[u8],
        input: &[u8],
        limits: ExecLimits,
    ) -> Result<ExecuteOutcome, SandboxError>;
}
