//! The container-isolated sandbox variant.
//!
//! Executes code inside a disposable `runc` container: no network
//! namespace, dropped capabilities, read-only code mount, writable
//! output mount only, non-root uid, a pid limit, a memory cap equal to
//! the execution's `max_memory`, and a cpu-time ulimit of
//! `ceil(max_time) + 1s`. One OCI bundle is built per call and torn
//! down (`runc delete` + workspace removal) on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use oj_shared::ProgrammingLanguage;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::{
    CompileOutcome, CompileResult, ExecLimits, ExecResult, ExecuteOutcome, Sandbox, SandboxError,
    Workspace, COMPILE_TIMEOUT,
};

/// Compiler/interpreter invocation for a language, resolved against a
/// per-language toolchain root bound read-only into the container.
struct Toolchain {
    /// Argv used to compile `src` into `bin` inside `/workspace`. Empty
    /// for languages that need no compilation.
    compile_argv: Vec<String>,
    /// Argv used to run the already-compiled (or interpreted) program.
    run_argv: Vec<String>,
}

fn toolchain_for(language: ProgrammingLanguage, src: &str) -> Toolchain {
    match language {
        ProgrammingLanguage::C => Toolchain {
            compile_argv: vec![
                "/usr/bin/gcc".into(),
                "-O2".into(),
                "-Wall".into(),
                format!("/workspace/{src}"),
                "-o".into(),
                "/workspace/main".into(),
            ],
            run_argv: vec!["/workspace/main".into()],
        },
        ProgrammingLanguage::Cpp => Toolchain {
            compile_argv: vec![
                "/usr/bin/g++".into(),
                "-O2".into(),
                "-Wall".into(),
                "-std=c++17".into(),
                format!("/workspace/{src}"),
                "-o".into(),
                "/workspace/main".into(),
            ],
            run_argv: vec!["/workspace/main".into()],
        },
        ProgrammingLanguage::Go => Toolchain {
            compile_argv: vec![
                "/usr/local/go/bin/go".into(),
                "build".into(),
                "-o".into(),
                "/workspace/main".into(),
                format!("/workspace/{src}"),
            ],
            run_argv: vec!["/workspace/main".into()],
        },
        ProgrammingLanguage::Java => Toolchain {
            compile_argv: vec![
                "/usr/bin/javac".into(),
                "-d".into(),
                "/workspace".into(),
                format!("/workspace/{src}"),
            ],
            run_argv: vec![
                "/usr/bin/java".into(),
                "-cp".into(),
                "/workspace".into(),
                "Main".into(),
            ],
        },
        ProgrammingLanguage::Python => Toolchain {
            compile_argv: vec![],
            run_argv: vec!["/usr/bin/python3".into(), format!("/workspace/{src}")],
        },
    }
}

/// Per-language toolchain roots bound read-only at `/bin`, `/usr/bin`,
/// `/lib`, `/lib64`, `/usr/lib`, `/usr/lib64` inside the container.
/// Defaults to the host's own toolchain paths (used by the CI image,
/// where every supported compiler is preinstalled on the image that
/// hosts the judger itself).
#[derive(Debug, Clone)]
pub struct ToolchainRoots(HashMap<ProgrammingLanguage, PathBuf>);

impl Default for ToolchainRoots {
    fn default() -> Self {
        let host = PathBuf::from("/");
        let mut map = HashMap::new();
        for lang in [
            ProgrammingLanguage::Go,
            ProgrammingLanguage::Python,
            ProgrammingLanguage::Java,
            ProgrammingLanguage::C,
            ProgrammingLanguage::Cpp,
        ] {
            map.insert(lang, host.clone());
        }
        Self(map)
    }
}

impl ToolchainRoots {
    pub fn get(&self, language: ProgrammingLanguage) -> &Path {
        self.0
            .get(&language)
            .map(PathBuf::as_path)
            .unwrap_or(Path::new("/"))
    }

    pub fn set(&mut self, language: ProgrammingLanguage, root: PathBuf) {
        self.0.insert(language, root);
    }
}

pub struct SecureSandbox {
    work_dir: PathBuf,
    toolchains: ToolchainRoots,
}

impl SecureSandbox {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            toolchains: ToolchainRoots::default(),
        }
    }

    pub fn with_toolchains(work_dir: impl Into<PathBuf>, toolchains: ToolchainRoots) -> Self {
        Self {
            work_dir: work_dir.into(),
            toolchains,
        }
    }

    fn oci_config(
        &self,
        workspace: &Workspace,
        toolchain_root: &Path,
        argv: &[String],
        limits: Option<ExecLimits>,
    ) -> serde_json::Value {
        let memory_limit = limits.map(|l| l.max_memory_bytes);
        let bind = |dest: &str, source: &Path, opts: &[&str]| {
            serde_json::json!({
                "destination": dest,
                "type": "bind",
                "source": source.display().to_string(),
                "options": opts,
            })
        };

        let mut resources = serde_json::json!({
            "devices": [{"allow": false, "access": "rwm"}],
            "pids": {"limit": 64},
        });
        if let Some(bytes) = memory_limit {
            resources["memory"] = serde_json::json!({"limit": bytes});
        }

        serde_json::json!({
            "ociVersion": "1.0.0",
            "process": {
                "terminal": false,
                "user": {"uid": 1000, "gid": 1000},
                "args": argv,
                "env": [
                    "PATH=/bin:/usr/bin:/usr/local/bin:/usr/local/go/bin",
                    "HOME=/workspace",
                ],
                "cwd": "/workspace",
                "capabilities": {
                    "bounding": [], "effective": [], "inheritable": [],
                    "permitted": [], "ambient": [],
                },
                "rlimits": [
                    {"type": "RLIMIT_CPU",
                     "hard": limits.map(|l| l.cpu_time_ulimit().as_secs()).unwrap_or(30),
                     "soft": limits.map(|l| l.cpu_time_ulimit().as_secs()).unwrap_or(30)},
                ],
            },
            "root": {"path": workspace.path().display().to_string(), "readonly": false},
            "hostname": "sandbox",
            "mounts": [
                {"destination": "/proc", "type": "proc", "source": "proc"},
                {"destination": "/dev", "type": "tmpfs", "source": "tmpfs",
                 "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]},
                bind("/bin", &toolchain_root.join("usr/bin"), &["rbind", "ro", "nosuid", "nodev"]),
                bind("/usr/bin", &toolchain_root.join("usr/bin"), &["rbind", "ro", "nosuid", "nodev"]),
                bind("/lib", &toolchain_root.join("lib"), &["rbind", "ro", "nosuid", "nodev"]),
                bind("/lib64", &toolchain_root.join("lib64"), &["rbind", "ro", "nosuid", "nodev"]),
                bind("/usr/lib", &toolchain_root.join("usr/lib"), &["rbind", "ro", "nosuid", "nodev"]),
                bind("/usr/local/go", &toolchain_root.join("usr/local/go"), &["rbind", "ro", "nosuid", "nodev"]),
            ],
            "linux": {
                "resources": resources,
                "namespaces": [
                    {"type": "pid"},
                    {"type": "network"},
                    {"type": "ipc"},
                    {"type": "uts"},
                    {"type": "mount"},
                ],
            },
        })
    }

    async fn write_bundle(
        &self,
        workspace: &Workspace,
        toolchain_root: &Path,
        argv: &[String],
        limits: Option<ExecLimits>,
    ) -> Result<(), SandboxError> {
        let config = self.oci_config(workspace, toolchain_root, argv, limits);
        tokio::fs::write(
            workspace.path().join("config.json"),
            serde_json::to_vec_pretty(&config).expect("OCI config serializes"),
        )
        .await
        .map_err(SandboxError::Workspace)
    }

    async fn runc_run(
        &self,
        workspace: &Workspace,
        input: &[u8],
        timeout: Duration,
    ) -> Result<(Vec<u8>, Duration, u64, RunOutcome), SandboxError> {
        let container_id = format!("oj-{}", Uuid::new_v4());
        let start = Instant::now();

        let mut child = Command::new("runc")
            .args(["run", "--bundle"])
            .arg(workspace.path())
            .arg(&container_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Infrastructure(format!("failed to start runc: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input).await;
            drop(stdin);
        }

        let (stdout, run_outcome) = match tokio::time::timeout(timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => {
                let run_outcome = if output.status.success() {
                    RunOutcome::Ok
                } else {
                    RunOutcome::NonZeroExit {
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }
                };
                (output.stdout, run_outcome)
            }
            Ok(Err(e)) => {
                return Err(SandboxError::Infrastructure(format!(
                    "failed to wait for runc: {e}"
                )));
            }
            Err(_) => (Vec::new(), RunOutcome::TimedOut),
        };

        let memory_bytes = read_memory_usage(&container_id).await.unwrap_or(0);
        terminate(&container_id).await;
        Ok((stdout, start.elapsed(), memory_bytes, run_outcome))
    }
}

enum RunOutcome {
    Ok,
    NonZeroExit { stderr: String },
    TimedOut,
}

async fn terminate(container_id: &str) {
    let _ = Command::new("runc")
        .args(["delete", "--force", container_id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// Best-effort peak memory usage via `runc events --stats`. Returns
/// `None` when the container has already exited and its cgroup was
/// reclaimed before the stats snapshot could be taken — the caller
/// treats that as "unavailable", not an error.
async fn read_memory_usage(container_id: &str) -> Option<u64> {
    let output = Command::new("runc")
        .args(["events", "--stats", container_id])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    value
        .get("data")?
        .get("memory")?
        .get("usage")?
        .get("usage")?
        .as_u64()
}

#[async_trait]
impl Sandbox for SecureSandbox {
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
        tokio::fs::write(workspace.source_path(&filename), code)
            .await
            .map_err(SandboxError::Workspace)?;

        let toolchain = toolchain_for(language, &filename);
        self.write_bundle(
            &workspace,
            self.toolchains.get(language),
            &toolchain.compile_argv,
            None,
        )
        .await?;

        let (_stdout, _elapsed, _memory, outcome) = self
            .runc_run(&workspace, &[], COMPILE_TIMEOUT)
            .await?;

        match outcome {
            RunOutcome::Ok => Ok(CompileOutcome {
                compile_output: String::new(),
                result: CompileResult::Ok,
            }),
            RunOutcome::NonZeroExit { stderr } => Ok(CompileOutcome {
                compile_output: stderr.clone(),
                result: CompileResult::CompileFailed { details: stderr },
            }),
            RunOutcome::TimedOut => Ok(CompileOutcome {
                compile_output: "compilation timed out".into(),
                result: CompileResult::CompileFailed {
                    details: "compilation exceeded the 30s hard cap".into(),
                },
            }),
        }
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
        tokio::fs::write(workspace.source_path(&filename), code)
            .await
            .map_err(SandboxError::Workspace)?;

        let toolchain = toolchain_for(language, &filename);

        if !toolchain.compile_argv.is_empty() {
            self.write_bundle(
                &workspace,
                self.toolchains.get(language),
                &toolchain.compile_argv,
                None,
            )
            .await?;
            let (_stdout, _elapsed, _memory, outcome) =
                self.runc_run(&workspace, &[], COMPILE_TIMEOUT).await?;
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

        self.write_bundle(
            &workspace,
            self.toolchains.get(language),
            &toolchain.run_argv,
            Some(limits),
        )
        .await?;

        let (stdout, elapsed, memory_bytes, outcome) = self
            .runc_run(&workspace, input, limits.max_time)
            .await?;

        let hit_memory_cap = memory_bytes >= limits.max_memory_bytes;
        let result = match outcome {
            RunOutcome::Ok => ExecResult::Ok,
            RunOutcome::NonZeroExit { stderr } if hit_memory_cap => {
                let _ = stderr;
                ExecResult::Oom
            }
            RunOutcome::NonZeroExit { stderr } => ExecResult::RuntimeError { details: stderr },
            RunOutcome::TimedOut => ExecResult::TimedOut,
        };

        Ok(ExecuteOutcome {
            stdout,
            elapsed,
            memory_estimate_bytes: memory_bytes,
            result,
        })
    }
}
