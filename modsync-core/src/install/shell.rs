//! Privileged shell sessions

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// One line of session output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellLine {
    Stdout(String),
    Stderr(String),
}

/// Runs a list of commands in a single shell session
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Run `commands` in order, passing every output line to `on_line` as it
    /// arrives. Returns whether the session exited successfully.
    async fn run(
        &self,
        commands: &[String],
        on_line: &mut (dyn FnMut(ShellLine) + Send),
    ) -> io::Result<bool>;
}

/// Shell session backed by a child process reading commands from stdin
#[derive(Debug, Clone)]
pub struct ProcessShell {
    program: String,
    args: Vec<String>,
}

impl ProcessShell {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Root shell through `su`
    pub fn root() -> Self {
        Self::new("su", Vec::new())
    }

    /// Unprivileged `sh`, used by rootless test installs
    pub fn plain() -> Self {
        Self::new("sh", Vec::new())
    }
}

#[async_trait]
impl ShellRunner for ProcessShell {
    async fn run(
        &self,
        commands: &[String],
        on_line: &mut (dyn FnMut(ShellLine) + Send),
    ) -> io::Result<bool> {
        debug!("Starting {} session with {} commands", self.program, commands.len());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut script = commands.join("\n");
            script.push_str("\nexit $?\n");
            stdin.write_all(script.as_bytes()).await?;
            stdin.flush().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("shell stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("shell stderr not captured"))?;
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out.next_line(), if !out_done => match line? {
                    Some(line) => on_line(ShellLine::Stdout(line)),
                    None => out_done = true,
                },
                line = err.next_line(), if !err_done => match line? {
                    Some(line) => on_line(ShellLine::Stderr(line)),
                    None => err_done = true,
                },
            }
        }

        let status = child.wait().await?;
        debug!("Shell session exited with {}", status);
        Ok(status.success())
    }
}
