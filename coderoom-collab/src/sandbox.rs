//! Bridge to the external sandboxed executor.
//!
//! The server never evaluates code itself. A [`SandboxExecutor`] receives the
//! buffer and language and reports stdout, stderr and the exit code.
//! [`ProcessExecutor`] runs one configured command per language (normally a
//! throwaway container) and pipes the code into its stdin.
//!
//! Every call gets a unique run name substituted for [`RUN_NAME`] in the
//! command line. If the call is dropped before the program exits (the
//! dispatcher's timeout), the configured abandon command is run with the
//! same name, so `docker kill {run}` reaches the container and not just the
//! local `docker` client.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::protocol::Language;

/// What the program printed and how it exited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No sandbox configured for {0}")]
    UnsupportedLanguage(Language),
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),
    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Run `code`. Implementations need not enforce a deadline; the
    /// dispatcher drops the future when its timeout fires.
    async fn execute(&self, code: &str, language: Language) -> Result<ExecutionOutput, ExecutorError>;
}

/// Placeholder replaced by the per-call run name in configured commands.
pub const RUN_NAME: &str = "{run}";

/// Per-language command lines for [`ProcessExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// argv per language; the code arrives on stdin.
    pub commands: HashMap<Language, Vec<String>>,
    /// Bytes kept from each output stream. The rest is read and dropped.
    #[serde(default = "default_capture_bytes")]
    pub max_capture_bytes: usize,
    /// Run when a call is dropped before its program exits.
    #[serde(default)]
    pub abandon_command: Option<Vec<String>>,
}

fn default_capture_bytes() -> usize {
    1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            max_capture_bytes: default_capture_bytes(),
            abandon_command: None,
        }
    }
}

const DOCKER_PREFIX: &[&str] = &[
    "docker",
    "run",
    "--rm",
    "-i",
    "--name",
    RUN_NAME,
    "--network",
    "none",
    "--memory",
    "128m",
    "--cpus",
    "0.5",
    "--pids-limit",
    "64",
];

impl SandboxConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Throwaway Docker containers without network access.
    pub fn docker_defaults() -> Self {
        let table = [
            (Language::JavaScript, docker("node:20-alpine", &["node", "-"])),
            (
                Language::TypeScript,
                docker("denoland/deno:alpine", &["deno", "run", "--quiet", "-"]),
            ),
            (Language::Python, docker("python:3.12-alpine", &["python", "-"])),
            (Language::Ruby, docker("ruby:3.3-alpine", &["ruby", "-"])),
            (Language::Php, docker("php:8.3-cli-alpine", &["php"])),
            (
                Language::Java,
                docker_sh(
                    "eclipse-temurin:21-jdk-alpine",
                    "cat > /tmp/Main.java && java /tmp/Main.java",
                ),
            ),
            (
                Language::C,
                docker_sh("gcc:13", "cat > /tmp/main.c && gcc -O1 -o /tmp/main /tmp/main.c && /tmp/main"),
            ),
            (
                Language::Cpp,
                docker_sh(
                    "gcc:13",
                    "cat > /tmp/main.cpp && g++ -O1 -o /tmp/main /tmp/main.cpp && /tmp/main",
                ),
            ),
            (
                Language::Go,
                docker_sh("golang:1.22-alpine", "cat > /tmp/main.go && go run /tmp/main.go"),
            ),
            (
                Language::Rust,
                docker_sh(
                    "rust:1-slim",
                    "cat > /tmp/main.rs && rustc -o /tmp/main /tmp/main.rs && /tmp/main",
                ),
            ),
        ];

        Self {
            commands: table.into_iter().collect(),
            abandon_command: Some(vec!["docker".into(), "kill".into(), RUN_NAME.into()]),
            ..Self::default()
        }
    }
}

fn docker(image: &str, command: &[&str]) -> Vec<String> {
    DOCKER_PREFIX
        .iter()
        .chain(std::iter::once(&image))
        .chain(command)
        .map(|arg| (*arg).to_owned())
        .collect()
}

/// Compiled languages write the source to a file first.
fn docker_sh(image: &str, script: &str) -> Vec<String> {
    docker(image, &["sh", "-c", script])
}

/// Runs each request as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: SandboxConfig,
}

impl ProcessExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn supports(&self, language: Language) -> bool {
        self.config
            .commands
            .get(&language)
            .is_some_and(|argv| !argv.is_empty())
    }
}

#[async_trait]
impl SandboxExecutor for ProcessExecutor {
    async fn execute(&self, code: &str, language: Language) -> Result<ExecutionOutput, ExecutorError> {
        let Some(argv) = self.config.commands.get(&language).filter(|argv| !argv.is_empty()) else {
            return Err(ExecutorError::UnsupportedLanguage(language));
        };
        let run_name = format!("coderoom-{}", Uuid::new_v4().simple());
        let argv = with_run_name(argv, &run_name);
        let (program, args) = (&argv[0], &argv[1..]);

        // Dropping the child (on timeout the whole future is dropped) kills it.
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Unavailable(format!("failed to start {program}: {e}")))?;
        let mut guard = AbandonGuard {
            run_name: run_name.clone(),
            argv: self
                .config
                .abandon_command
                .as_ref()
                .map(|argv| with_run_name(argv, &run_name)),
        };

        let limit = self.config.max_capture_bytes;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let code = code.to_owned();
        let writer = async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading all of its input.
                let _ = stdin.write_all(code.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        };

        let (_, stdout, stderr, status) = tokio::join!(
            writer,
            read_capped(stdout, limit),
            read_capped(stderr, limit),
            child.wait()
        );
        guard.disarm();
        let status = status?;

        log::debug!("Sandbox {run_name} for {language} exited with {status}");
        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&stdout?).into_owned(),
            stderr: String::from_utf8_lossy(&stderr?).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn with_run_name(argv: &[String], run_name: &str) -> Vec<String> {
    argv.iter().map(|arg| arg.replace(RUN_NAME, run_name)).collect()
}

/// Runs the abandon command when a call is dropped mid-run.
struct AbandonGuard {
    run_name: String,
    argv: Option<Vec<String>>,
}

impl AbandonGuard {
    fn disarm(&mut self) {
        self.argv = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(argv) = self.argv.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to clean up abandoned sandbox {}", self.run_name);
            return;
        };
        let run_name = std::mem::take(&mut self.run_name);
        handle.spawn(async move {
            let Some((program, args)) = argv.split_first() else {
                return;
            };
            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) => log::info!("Abandoned sandbox {run_name} cleaned up ({status})"),
                Err(e) => log::warn!("Failed to clean up abandoned sandbox {run_name}: {e}"),
            }
        });
    }
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(
    stream: Option<R>,
    limit: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut kept = Vec::new();
    let Some(mut stream) = stream else {
        return Ok(kept);
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
}
