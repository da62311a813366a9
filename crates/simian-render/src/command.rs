//! Render command builder and runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{RenderError, RenderResult};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

/// Builder for render commands.
#[derive(Debug, Clone)]
pub struct RenderCommand {
    /// Program to execute
    program: String,
    /// Arguments before the render flags (e.g. `-m simian.render --`)
    prefix_args: Vec<String>,
    /// Render flags
    args: Vec<String>,
    /// Working directory
    current_dir: Option<PathBuf>,
}

impl RenderCommand {
    /// Create a new command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Add arguments placed before every render flag.
    pub fn prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a `--name value` flag.
    pub fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push(format!("--{}", name));
        self.args.push(value.to_string());
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Runner for render commands with an optional timeout.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Set timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a render command to completion.
    pub async fn run(&self, cmd: &RenderCommand) -> RenderResult<()> {
        check_program(cmd.program())?;

        let args = cmd.build_args();
        debug!("Running render: {} {}", cmd.program(), args.join(" "));

        let mut command = Command::new(cmd.program());
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn()?;

        // Drain stdout so a chatty renderer never blocks on a full pipe
        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "simian_render::output", "{}", line);
                }
            })
        });

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let result = self.wait_for_exit(&mut child).await;

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        let stderr = match stderr_handle {
            Some(handle) => handle.await.ok().filter(|s| !s.is_empty()),
            None => None,
        };

        match result? {
            status if status.success() => Ok(()),
            status => Err(RenderError::failed(
                format!("{} exited with {}", cmd.program(), status),
                stderr,
                status.code(),
            )),
        }
    }

    async fn wait_for_exit(&self, child: &mut Child) -> RenderResult<std::process::ExitStatus> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait().await?);
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("Render timed out after {:?}, killing process", timeout);
                let _ = child.kill().await;
                Err(RenderError::Timeout(timeout.as_secs()))
            }
        }
    }
}

/// Check that the render program resolves on PATH (or is a usable path).
pub fn check_program(program: &str) -> RenderResult<PathBuf> {
    which::which(program).map_err(|_| RenderError::ProgramNotFound(program.to_string()))
}
