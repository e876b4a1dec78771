//! Container runtime interface.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    /// A container with the requested name already exists.
    #[error("container name in use: {0}")]
    Conflict(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// What the runtime reports about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Container port to host port, only for published ports.
    pub ports: HashMap<u16, u16>,
}

impl ContainerInfo {
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}

/// Parameters of a new sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub user: String,
    pub env: Vec<(String, String)>,
    /// Published to an OS-assigned host port.
    pub service_port: u16,
    pub host_dir: PathBuf,
    pub mount_point: String,
    pub labels: Vec<(String, String)>,
    pub command: Vec<String>,
}

/// An interactive process to start inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub user: String,
    pub workdir: String,
    pub command: Vec<String>,
}

/// Attached stdio of an interactive exec under a pseudo-tty.
///
/// `output` yields container bytes in order and closes at end of stream.
/// Bytes sent on `input` reach the process's stdin in order. Dropping the
/// session tears the process down.
pub struct ExecSession {
    pub output: mpsc::Receiver<io::Result<Vec<u8>>>,
    pub input: mpsc::Sender<Vec<u8>>,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl ExecSession {
    pub fn new(
        output: mpsc::Receiver<io::Result<Vec<u8>>>,
        input: mpsc::Sender<Vec<u8>>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            output,
            input,
            teardown: Some(Box::new(teardown)),
        }
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").finish_non_exhaustive()
    }
}

/// Commands the sandbox manager issues to a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look a container up by name or id.
    async fn inspect(&self, name_or_id: &str) -> RuntimeResult<Option<ContainerInfo>>;

    /// Containers whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> RuntimeResult<Vec<ContainerInfo>>;

    /// Create (but do not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, id: &str) -> RuntimeResult<()>;

    async fn exec_interactive(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecSession>;
}
