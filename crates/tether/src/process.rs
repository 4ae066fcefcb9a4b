//! Runtime subprocess spawning.
//!
//! The supervisor never talks to `tokio::process` directly; it goes through
//! [`ProcessFactory`] so tests can stand in an in-memory runtime built on
//! duplex pipes. The native factory spawns the configured binary with all
//! three stdio streams piped.

use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::RuntimeConfig;

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// A spawned runtime with its stdio streams detached for the supervisor.
pub struct ProcessHandle {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ProcessControl>,
}

/// Lifecycle control over a spawned runtime.
#[async_trait]
pub trait ProcessControl: Send {
    /// Ask the process to die. Idempotent.
    async fn terminate(&mut self);

    /// Wait for the process to exit. Resolves at most once; later calls
    /// return immediately.
    async fn wait(&mut self);
}

/// Spawns runtime processes.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn spawn(&self, config: &RuntimeConfig) -> Result<ProcessHandle>;
}

/// Spawns the real runtime binary with piped stdio.
pub struct NativeProcessFactory;

#[async_trait]
impl ProcessFactory for NativeProcessFactory {
    async fn spawn(&self, config: &RuntimeConfig) -> Result<ProcessHandle> {
        let mut child = Command::new(&config.binary)
            .args(&config.args)
            .envs(&config.env)
            .current_dir(&config.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning runtime {}", config.binary.display()))?;

        let stdin = child
            .stdin
            .take()
            .context("runtime child has no stdin handle")?;
        let stdout = child
            .stdout
            .take()
            .context("runtime child has no stdout handle")?;
        let stderr = child.stderr.take();

        Ok(ProcessHandle {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: stderr.map(|s| Box::pin(s) as BoxedReader),
            control: Box::new(NativeControl { child }),
        })
    }
}

struct NativeControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for NativeControl {
    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("kill on exited runtime: {}", e);
        }
    }

    async fn wait(&mut self) {
        match self.child.wait().await {
            Ok(status) => log::info!("runtime exited with {}", status),
            Err(e) => log::warn!("waiting on runtime: {}", e),
        }
    }
}
