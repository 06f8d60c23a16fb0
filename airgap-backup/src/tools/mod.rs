//! External tool invocation.
//!
//! Everything the pipeline delegates to the host (block device queries,
//! partition tables, mounts, bootloader) goes through [`SystemTools`], so the
//! executor can be driven against a scripted implementation in tests.

pub mod devices;

#[cfg(test)]
pub mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}: {}", status_text(.status), .stderr.trim())]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from {program}: {reason}")]
    InvalidOutput { program: String, reason: String },
}

fn status_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// A single external command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// File fed to the tool's standard input.
    pub stdin_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(stdin) = &self.stdin_file {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Host integration used by the backup, verify and restore executors.
#[allow(async_fn_in_trait)]
pub trait SystemTools {
    /// Run an external command to completion. Non-zero exit is an error.
    async fn run(&self, command: ToolCommand) -> Result<ToolOutput, ToolError>;

    fn is_block_device(&self, path: &Path) -> std::io::Result<bool> {
        use std::os::unix::fs::FileTypeExt;
        Ok(std::fs::metadata(path)?.file_type().is_block_device())
    }

    /// Free bytes on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        devices::available_space(path)
    }
}

/// Runs the real binaries found on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTools;

impl SystemTools for HostTools {
    async fn run(&self, command: ToolCommand) -> Result<ToolOutput, ToolError> {
        debug!("exec: {}", command);

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);

        match &command.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|source| ToolError::Spawn {
                    program: command.program.clone(),
                    source,
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        let output = cmd.output().await.map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ToolError::Failed {
                program: command.program,
                status: output.status.code(),
                stderr,
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}
