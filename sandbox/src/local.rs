//! The host-toolchain sandbox variant, intended for development.
//!
//! Runs the same external contract as [`crate::secure::SecureSandbox`]
//! but directly against the host's compilers and interpreters, with no
//! container isolation. Memory accounting is a documented non-goal
//! here: [`LocalSandbox`] reports a conservative output-length-derived
//! estimate rather than true process memory, so any property test that
//! asserts `memory_limit_exceeded` must run against the secure variant.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use oj_shared::ProgrammingLanguage;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::{
    CompileOutcome, CompileResult, ExecLimits, ExecResult, ExecuteOutcome, Sandbox, SandboxError,
    Workspace, COMPILE_TIMEOUT,
};

/// Grace period between SIGTERM and SIGKILL when a timed-out process
/// does not exit promptly.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(200);

struct HostToolchain {
    compile: Option<(String, Vec<String>)>,
    run: (String, Vec<String>),
}

fn host_toolchain(language: ProgrammingLanguage, main_path: &str, bin_path: &str) -> HostToolchain {
    match language {
        ProgrammingLanguage::C => HostToolchain {
            compile: Some((
                "gcc".into(),
                vec!["-O2".into(), "-Wall".into(), main_path.into(), "-o".into(), bin_path.into()],
            )),
            run: (bin_path.into(), vec![]),
        },
        ProgrammingLanguage::Cpp => HostToolchain {
            compile: Some((
                "g++".into(),
                vec![
                    "-O2".into(),
                    "-Wall".into(),
                    "-std=c++17".into(),
                    main_path.into(),
                    "-o".into(),
                    bin_path.into(),
                ],
            )),
            run: (bin_path.into(), vec![]),
        },
        ProgrammingLanguage::Go => HostToolchain {
            compile: Some((
                "go".into(),
                vec!["build".into(), "-o".into(), bin_path.into(), main_path.into()],
            )),
            run: (bin_path.into(), vec![]),
        },
        ProgrammingLanguage::Java => HostToolchain {
            compile: Some(("javac".into(), vec![main_path.into()])),
            run: ("java".into(), vec!["-cp".into(), ".".into(), "Main".into()]),
        },
        ProgrammingLanguage::Python => HostToolchain {
            compile: None,
            run: ("python3".into(), vec![main_path.into()]),
        },
    }
}

pub struct LocalSandbox {
    work_dir: PathBuf,
}

impl LocalSandbox {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

enum RunOutcome {
    Ok,
    NonZeroExit { stderr: String },
    TimedOut,
}

/// Terminates `child` by pid: SIGTERM, a brief grace period, then
/// SIGKILL if it survives.
async fn terminate_gracefully(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let nix_pid = Pid::from_raw(raw);
    let _ = signal::kill(nix_pid, Signal::SIGTERM);
    tokio::time::sleep(KILL_GRACE_PERIOD).await;
    let _ = signal::kill(nix_pid, Signal::SIGKILL);
}

/// Runs `command` against `input`, racing a cancellation timer set to
/// `timeout`. On timer firing, sends SIGTERM, waits a grace period,
/// then SIGKILL, and reports `TimedOut`.
async fn execute_with_deadline(
    mut command: Command,
    input: Vec<u8>,
    timeout: Duration,
) -> Result<(Vec<u8>, Duration, RunOutcome), SandboxError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child: Child = command
        .spawn()
        .map_err(|e| SandboxError::Infrastructure(format!("failed to spawn process: {e}")))?;
    let pid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&input).await;
        drop(stdin);
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let outcome = if output.status.success() {
                RunOutcome::Ok
            } else {
                RunOutcome::NonZeroExit {
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }
            };
            Ok((output.stdout, start.elapsed(), outcome))
        }
        Ok(Err(e)) => Err(SandboxError::Infrastructure(format!(
            "failed to wait for process: {e}"
        ))),
        Err(_) => {
            if let Some(pid) = pid {
                terminate_gracefully(pid).await;
            }
            Ok((Vec::new(), start.elapsed(), RunOutcome::TimedOut))
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn compile(
        &self,
        language: ProgrammingLanguage,
        code: &[u8],
    ) -> Result<CompileOutcome, SandboxError> {
        if !language.needs_compilation() {
            return Ok(CompileOutcome {
                compile_output: String::new(),
                result: CompileResult::Ok,
            });
        }

        let workspace = Workspace::create(&self.work_dir)?;
        let filename = format!("main.{}", language.file_extension());
        let main_path = workspace.source_path(&filename);
        tokio::fs::write(&main_path, code)
            .await
            .map_err(SandboxError::Workspace)?;

        let bin_path = workspace.path().join("main");
        let toolchain = host_toolchain(
            language,
            &main_path.display().to_string(),
            &bin_path.display().to_string(),
        );
        let Some((program, args)) = toolchain.compile else {
            return Ok(CompileOutcome {
                compile_output: String::new(),
                result: CompileResult::Ok,
            });
        };

        let mut command = Command::new(program);
        command.args(args).current_dir(workspace.path());

        let (_stdout, elapsed, outcome) =
            execute_with_deadline(command, Vec::new(), COMPILE_TIMEOUT).await?;
        let _ = elapsed;

        Ok(match outcome {
            RunOutcome::Ok => CompileOutcome {
                compile_output: String::new(),
                result: CompileResult::Ok,
            },
            RunOutcome::NonZeroExit { stderr } => CompileOutcome {
                compile_output: stderr.clone(),
                result: CompileResult::CompileFailed { details: stderr },
            },
            RunOutcome::TimedOut => CompileOutcome {
                compile_output: "compilation timed out".into(),
                result: CompileResult::CompileFailed {
                    details: "compilation exceeded the 30s hard cap".into(),
                },
            },
        })
    }

    async fn execute(
        &self,
        language: ProgrammingLanguage,
        code: &[u8],
        input: &[u8],
        limits: ExecLimits,
    ) -> Result<ExecuteOutcome, SandboxError> {
        let workspace = Workspace::create(&self.work_dir)?;
        let filename = format!("main.{}", language.file_extension());
        let main_path = workspace.source_path(&filename);
        tokio::fs::write(&main_path, code)
            .await
            .map_err(SandboxError::Workspace)?;

        let bin_path = workspace.path().join("main");
        let toolchain = host_toolchain(
            language,
            &main_path.display().to_string(),
            &bin_path.display().to_string(),
        );

        if let Some((program, args)) = &toolchain.compile {
            let mut command = Command::new(program);
            command.args(args).current_dir(workspace.path());
            let (_stdout, _elapsed, outcome) =
                execute_with_deadline(command, Vec::new(), COMPILE_TIMEOUT).await?;
            match outcome {
                RunOutcome::Ok => {}
                RunOutcome::NonZeroExit { stderr } => {
                    return Ok(ExecuteOutcome {
                        stdout: Vec::new(),
                        elapsed: Duration::ZERO,
                        memory_estimate_bytes: 0,
                        result: ExecResult::StartFailed {
                            details: format!("compile step failed during execute: {stderr}"),
                        },
                    });
                }
                RunOutcome::TimedOut => {
                    return Ok(ExecuteOutcome {
                        stdout: Vec::new(),
                        elapsed: Duration::ZERO,
                        memory_estimate_bytes: 0,
                        result: ExecResult::StartFailed {
                            details: "compile step timed out during execute".into(),
                        },
                    });
                }
            }
        }

        let (program, args) = &toolchain.run;
        let mut command = Command::new(program);
        command.args(args).current_dir(workspace.path());

        let (stdout, elapsed, outcome) =
            execute_with_deadline(command, input.to_vec(), limits.max_time).await?;

        let result = match outcome {
            RunOutcome::Ok => ExecResult::Ok,
            RunOutcome::NonZeroExit { stderr } => ExecResult::RuntimeError { details: stderr },
            RunOutcome::TimedOut => ExecResult::TimedOut,
        };

        // Documented non-goal: no real memory accounting in local mode.
        // The output length is a conservative, deterministic stand-in
        // that lets unit tests exercise the plumbing without asserting
        // on actual resident set size.
        let memory_estimate_bytes = stdout.len() as u64;

        Ok(ExecuteOutcome {
            stdout,
            elapsed,
            memory_estimate_bytes,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sandbox() -> LocalSandbox {
        let root = std::env::temp_dir().join(format!(
            "oj-local-sandbox-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&root).unwrap();
        LocalSandbox::new(root)
    }

    #[tokio::test]
    async fn python_echo_is_accepted() {
        let sb = sandbox();
        let code = b"import sys\nprint(sys.stdin.readline().strip())\n";
        let outcome = sb
            .execute(
                ProgrammingLanguage::Python,
                code,
                b"Echo this\n",
                ExecLimits::new(Duration::from_secs(5), 64 * 1024 * 1024),
            )
            .await
            .unwrap();
        assert!(matches!(outcome.result, ExecResult::Ok));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "Echo this");
    }

    #[tokio::test]
    async fn python_sleep_past_limit_times_out() {
        let sb = sandbox();
        let code = b"import time\ntime.sleep(5)\n";
        let outcome = sb
            .execute(
                ProgrammingLanguage::Python,
                code,
                b"",
                ExecLimits::new(Duration::from_millis(200), 64 * 1024 * 1024),
            )
            .await
            .unwrap();
        assert!(matches!(outcome.result, ExecResult::TimedOut));
    }

    #[test]
    fn cpu_time_ulimit_rounds_up_and_adds_one_second() {
        let limits = ExecLimits::new(Duration::from_millis(1500), 1024);
        assert_eq!(limits.cpu_time_ulimit(), Duration::from_secs(3));
    }
}
