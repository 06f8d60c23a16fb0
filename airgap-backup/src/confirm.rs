//! Operator confirmation prompts for destructive operations.

use std::io::{self, BufRead, Write};

#[allow(async_fn_in_trait)]
pub trait Confirm {
    /// Show `prompt` and return the operator's answer, trimmed.
    async fn ask(&self, prompt: &str) -> io::Result<String>;
}

/// Prompts on stderr and reads the answer from stdin.
///
/// The read runs on the blocking pool so the runtime keeps servicing
/// signals while the operator is thinking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    async fn ask(&self, prompt: &str) -> io::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{} ", prompt)?;
        stderr.flush()?;

        read_line_blocking(|| io::stdin().lock()).await
    }
}

/// Read one trimmed line from the reader produced by `open`, off the runtime.
async fn read_line_blocking<F, R>(open: F) -> io::Result<String>
where
    F: FnOnce() -> R + Send + 'static,
    R: BufRead,
{
    tokio::task::spawn_blocking(move || {
        let mut answer = String::new();
        open().read_line(&mut answer)?;
        Ok(answer.trim().to_string())
    })
    .await
    .map_err(io::Error::other)?
}

/// Pre-recorded answers, consumed in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedConfirm {
    answers: std::cell::RefCell<std::collections::VecDeque<String>>,
    prompts: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl ScriptedConfirm {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: std::cell::RefCell::new(answers.into_iter().map(Into::into).collect()),
            prompts: Default::default(),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

#[cfg(test)]
impl Confirm for ScriptedConfirm {
    async fn ask(&self, prompt: &str) -> io::Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or_default())
    }
}
