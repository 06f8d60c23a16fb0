//! Scripted [`SystemTools`] for executor tests.
//!
//! Records every command together with a snapshot of a watched file, so tests
//! can assert both the order of tool calls and what had been written to the
//! destination at the time each call happened.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::{SystemTools, ToolCommand, ToolError, ToolOutput};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: ToolCommand,
    /// Contents of the watched file when the command ran.
    pub watched: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct MockTools {
    block_devices: HashSet<PathBuf>,
    responses: HashMap<String, Result<String, String>>,
    watch: Option<PathBuf>,
    available_space: Option<u64>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl MockTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `path` as a block device; `blockdev --getsize64` reports its length.
    pub fn with_block_device(mut self, path: &Path) -> Self {
        self.block_devices.insert(path.to_path_buf());
        self
    }

    /// Canned stdout for the first program word (e.g. `"lsblk"`).
    pub fn respond(mut self, program: &str, stdout: &str) -> Self {
        self.responses
            .insert(program.to_string(), Ok(stdout.to_string()));
        self
    }

    /// Make every invocation of `program` fail.
    pub fn fail(mut self, program: &str, stderr: &str) -> Self {
        self.responses
            .insert(program.to_string(), Err(stderr.to_string()));
        self
    }

    /// Report `bytes` free on every filesystem.
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space = Some(bytes);
        self
    }

    pub fn watch(mut self, path: &Path) -> Self {
        self.watch = Some(path.to_path_buf());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|c| c.command.program.clone())
            .collect()
    }
}

impl SystemTools for MockTools {
    async fn run(&self, command: ToolCommand) -> Result<ToolOutput, ToolError> {
        let watched = self.watch.as_ref().and_then(|p| std::fs::read(p).ok());
        self.calls.borrow_mut().push(RecordedCall {
            command: command.clone(),
            watched,
        });

        if command.program == "blockdev" && command.args.first().map(String::as_str) == Some("--getsize64") {
            let path = PathBuf::from(&command.args[1]);
            let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            return Ok(ToolOutput {
                stdout: format!("{}\n", len),
                stderr: String::new(),
            });
        }

        match self.responses.get(&command.program) {
            Some(Ok(stdout)) => Ok(ToolOutput {
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            Some(Err(stderr)) => Err(ToolError::Failed {
                program: command.program,
                status: Some(1),
                stderr: stderr.clone(),
            }),
            None if command.program == "lsblk" => Ok(ToolOutput {
                stdout: r#"{"blockdevices": []}"#.to_string(),
                stderr: String::new(),
            }),
            None => Ok(ToolOutput::default()),
        }
    }

    fn is_block_device(&self, path: &Path) -> std::io::Result<bool> {
        std::fs::metadata(path)?;
        Ok(self.block_devices.contains(path))
    }

    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        match self.available_space {
            Some(bytes) => Ok(bytes),
            None => super::devices::available_space(path),
        }
    }
}
