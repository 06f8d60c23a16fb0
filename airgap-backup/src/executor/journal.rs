//! Run journal: tracing output mirrored into `backup.log`.
//!
//! Lines recorded before the log file exists (preflight) are buffered and
//! flushed when [`Journal::attach`] is called.

use chrono::Local;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::{error, info, warn};

use super::{WarningKind, Warnings};

#[derive(Debug, Default)]
pub struct Journal {
    warnings: Warnings,
    pending: Vec<String>,
    file: Option<File>,
    /// Set after the first failed write to the log file
    log_failed: bool,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start writing to `path`, flushing everything recorded so far.
    pub fn attach(&mut self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        for line in self.pending.drain(..) {
            writeln!(file, "{}", line)?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn record(&mut self, level: &str, message: &str) {
        let line = format!(
            "[{}] {:<5} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        match self.file.as_mut() {
            // Reported once; a full disk also fails the payload write.
            Some(file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    if !self.log_failed {
                        warn!("could not write backup.log: {}", e);
                        self.log_failed = true;
                    }
                }
            }
            None => self.pending.push(line),
        }
    }

    pub fn step(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);
        self.record("INFO", message);
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        self.record("WARN", &message);
        self.warnings.push(kind, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!("{}", message);
        self.record("ERROR", message);
    }

    /// Whether any line failed to reach the log file.
    pub fn log_failed(&self) -> bool {
        self.log_failed
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    pub fn into_warnings(self) -> Warnings {
        self.warnings
    }
}
