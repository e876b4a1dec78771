//! Sandbox lifecycle: one container per project, created on demand.
//!
//! The container runtime is the source of truth. The only local state is the
//! map of in-flight bring-up attempts, which collapses concurrent callers for
//! the same project on this replica into one attempt. Other replicas race
//! through the runtime, where the deterministic container name makes a second
//! create fail with a conflict that is resolved by looking the winner up.

mod docker;
mod mock;
mod runtime;

pub use self::docker::DockerCli;
pub use self::mock::MockRuntime;
pub use self::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, RuntimeError,
    RuntimeResult,
};

use crate::files::{FileError, Workspace};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Prefix of every sandbox container name.
pub const CONTAINER_PREFIX: &str = "project-";

/// Label carrying the project id on sandbox containers.
pub const PROJECT_LABEL: &str = "collabd.project";

/// Deterministic container name of a project's sandbox.
pub fn container_name(project_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{project_id}")
}

#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("container runtime: {0}")]
    Runtime(String),

    #[error("workspace: {0}")]
    Workspace(String),

    #[error("container {0} did not reach running state")]
    NotRunning(String),

    #[error("sandbox bring-up aborted: {0}")]
    Aborted(String),
}

impl From<RuntimeError> for SandboxError {
    fn from(e: RuntimeError) -> Self {
        SandboxError::Runtime(e.to_string())
    }
}

impl From<FileError> for SandboxError {
    fn from(e: FileError) -> Self {
        SandboxError::Workspace(e.to_string())
    }
}

/// Container settings shared by every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub user: String,
    pub service_port: u16,
    pub mount_point: String,
    pub shell: Vec<String>,
    /// Wait after opening an exec before treating the shell as interactive.
    pub exec_warmup: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "sandbox".to_string(),
            user: "sandbox".to_string(),
            service_port: 5173,
            mount_point: "/home/sandbox/app".to_string(),
            shell: vec!["/bin/bash".to_string()],
            exec_warmup: Duration::from_millis(1500),
        }
    }
}

/// Lifecycle state as observed now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SandboxState {
    Absent,
    Creating,
    Running,
    Stopped,
}

/// A sandbox confirmed running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSandbox {
    pub container_id: String,
    pub name: String,
    pub port: Option<u16>,
}

/// Entry of [`SandboxManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub project_id: String,
    pub container_id: String,
    pub state: SandboxState,
    pub port: Option<u16>,
}

type Attempt = Shared<BoxFuture<'static, Result<RunningSandbox, SandboxError>>>;
type InFlight = Arc<Mutex<HashMap<String, Attempt>>>;

/// Clears a project's in-flight entry however the attempt ends.
struct InFlightGuard {
    in_flight: InFlight,
    project_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project_id);
    }
}

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Workspace,
    config: SandboxConfig,
    in_flight: InFlight,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, workspace: Workspace, config: SandboxConfig) -> Self {
        Self {
            runtime,
            workspace,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn is_in_flight(&self, project_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(project_id)
    }

    /// Make sure the project's container exists and is running.
    ///
    /// Concurrent callers on this replica share one attempt and all observe
    /// its outcome. Failures are returned, never retried.
    pub async fn ensure_running(&self, project_id: &str) -> Result<RunningSandbox, SandboxError> {
        crate::events::validate_project_id(project_id).map_err(SandboxError::InvalidProject)?;
        let attempt = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(project_id) {
                Some(attempt) => attempt.clone(),
                None => {
                    let guard = InFlightGuard {
                        in_flight: Arc::clone(&self.in_flight),
                        project_id: project_id.to_string(),
                    };
                    let runtime = Arc::clone(&self.runtime);
                    let workspace = self.workspace.clone();
                    let config = self.config.clone();
                    let project = project_id.to_string();
                    // Spawned so the attempt finishes even if every caller
                    // goes away.
                    let task = tokio::spawn(async move {
                        let _guard = guard;
                        bring_up(runtime.as_ref(), &workspace, &config, &project).await
                    });
                    let attempt: Attempt = async move {
                        task.await
                            .unwrap_or_else(|e| Err(SandboxError::Aborted(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(project_id.to_string(), attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Host port currently mapped to the service port. Never creates.
    pub async fn get_port(&self, project_id: &str) -> Result<Option<u16>, SandboxError> {
        Ok(self
            .runtime
            .inspect(&container_name(project_id))
            .await?
            .and_then(|c| c.host_port(self.config.service_port)))
    }

    pub async fn state(&self, project_id: &str) -> Result<SandboxState, SandboxError> {
        let info = self.runtime.inspect(&container_name(project_id)).await?;
        Ok(match info {
            Some(c) if c.running => SandboxState::Running,
            _ if self.is_in_flight(project_id) => SandboxState::Creating,
            Some(_) => SandboxState::Stopped,
            None => SandboxState::Absent,
        })
    }

    /// Sandbox containers the runtime knows about.
    pub async fn list(&self) -> Result<Vec<SandboxSummary>, SandboxError> {
        Ok(self
            .runtime
            .list(CONTAINER_PREFIX)
            .await?
            .into_iter()
            .filter_map(|c| {
                let project_id = c.name.strip_prefix(CONTAINER_PREFIX)?.to_string();
                Some(SandboxSummary {
                    state: if c.running {
                        SandboxState::Running
                    } else {
                        SandboxState::Stopped
                    },
                    port: c.host_port(self.config.service_port),
                    container_id: c.id,
                    project_id,
                })
            })
            .collect())
    }

    /// Open an interactive shell in a running sandbox.
    pub async fn open_shell(&self, container_id: &str) -> Result<ExecSession, SandboxError> {
        let spec = ExecSpec {
            user: self.config.user.clone(),
            workdir: self.config.mount_point.clone(),
            command: self.config.shell.clone(),
        };
        Ok(self.runtime.exec_interactive(container_id, &spec).await?)
    }
}

fn container_spec(config: &SandboxConfig, project_id: &str, host_dir: std::path::PathBuf) -> ContainerSpec {
    ContainerSpec {
        name: container_name(project_id),
        image: config.image.clone(),
        user: config.user.clone(),
        env: vec![("HOST".to_string(), "0.0.0.0".to_string())],
        service_port: config.service_port,
        host_dir,
        mount_point: config.mount_point.clone(),
        labels: vec![(PROJECT_LABEL.to_string(), project_id.to_string())],
        // Keeps the container alive between terminal sessions.
        command: vec![
            "bash".to_string(),
            "-c".to_string(),
            "echo 'sandbox ready'; exec sleep infinity".to_string(),
        ],
    }
}

async fn bring_up(
    runtime: &dyn ContainerRuntime,
    workspace: &Workspace,
    config: &SandboxConfig,
    project_id: &str,
) -> Result<RunningSandbox, SandboxError> {
    let name = container_name(project_id);
    let existing = match runtime.inspect(&name).await? {
        Some(c) => c,
        None => {
            let host_dir = workspace.ensure_project_dir(project_id).await?;
            match runtime.create(&container_spec(config, project_id, host_dir)).await {
                Ok(id) => {
                    info!(project_id, container = %name, id = %id, "sandbox created");
                    runtime
                        .inspect(&id)
                        .await?
                        .ok_or_else(|| SandboxError::Runtime(format!("{name} vanished after create")))?
                }
                Err(RuntimeError::Conflict(_)) => {
                    // Another replica won the create race.
                    warn!(project_id, container = %name, "sandbox created concurrently elsewhere");
                    runtime
                        .inspect(&name)
                        .await?
                        .ok_or_else(|| SandboxError::Runtime(format!("{name} conflict but not found")))?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    if !existing.running {
        runtime.start(&existing.id).await?;
        info!(project_id, container = %name, "sandbox started");
    }

    let current = runtime
        .inspect(&existing.id)
        .await?
        .filter(|c| c.running)
        .ok_or_else(|| SandboxError::NotRunning(name.clone()))?;
    Ok(RunningSandbox {
        port: current.host_port(config.service_port),
        container_id: current.id,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(runtime: MockRuntime) -> (Arc<SandboxManager>, Arc<MockRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(runtime);
        let manager = SandboxManager::new(
            runtime.clone(),
            Workspace::new(dir.path()),
            SandboxConfig::default(),
        );
        (Arc::new(manager), runtime, dir)
    }

    #[tokio::test]
    async fn port_is_none_until_running() {
        let (sandboxes, _rt, _dir) = manager(MockRuntime::new());
        assert_eq!(sandboxes.get_port("p1").await.unwrap(), None);
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Absent);

        let running = sandboxes.ensure_running("p1").await.unwrap();
        assert_eq!(running.name, "project-p1");
        let port = sandboxes.get_port("p1").await.unwrap();
        assert!(port.is_some_and(|p| p > 0));
        assert_eq!(port, running.port);
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Running);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_container() {
        let (sandboxes, rt, _dir) = manager(MockRuntime::with_create_delay(50));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sandboxes = sandboxes.clone();
            tasks.push(tokio::spawn(async move { sandboxes.ensure_running("p1").await }));
        }
        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap().unwrap().container_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(rt.create_count(), 1);
        assert!(!sandboxes.is_in_flight("p1"));
    }

    #[tokio::test]
    async fn creating_is_reported_while_in_flight() {
        let (sandboxes, _rt, _dir) = manager(MockRuntime::with_create_delay(200));
        let bg = sandboxes.clone();
        let pending = tokio::spawn(async move { bg.ensure_running("p1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Creating);
        pending.await.unwrap().unwrap();
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Running);
    }

    #[tokio::test]
    async fn stopped_container_is_restarted_not_recreated() {
        let (sandboxes, rt, _dir) = manager(MockRuntime::new());
        let first = sandboxes.ensure_running("p1").await.unwrap();
        rt.stop("project-p1").await;
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Stopped);
        assert_eq!(sandboxes.get_port("p1").await.unwrap(), None);

        let second = sandboxes.ensure_running("p1").await.unwrap();
        assert_eq!(first.container_id, second.container_id);
        assert_eq!(rt.create_count(), 1);
    }

    #[tokio::test]
    async fn failure_clears_guard_and_is_reported() {
        let (sandboxes, rt, _dir) = manager(MockRuntime::failing());
        let err = sandboxes.ensure_running("p1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
        assert!(!sandboxes.is_in_flight("p1"));
        assert_eq!(rt.create_count(), 0);
        assert_eq!(sandboxes.state("p1").await.unwrap(), SandboxState::Absent);
    }

    #[tokio::test]
    async fn container_mounts_project_dir() {
        let (sandboxes, rt, dir) = manager(MockRuntime::new());
        sandboxes.ensure_running("p1").await.unwrap();
        let spec = rt.spec_of("project-p1").await.unwrap();
        assert_eq!(spec.host_dir, dir.path().join("p1"));
        assert!(spec.host_dir.is_dir());
        assert_eq!(spec.mount_point, "/home/sandbox/app");
        assert_eq!(spec.service_port, 5173);
    }

    #[tokio::test]
    async fn invalid_project_is_rejected_before_runtime() {
        let (sandboxes, rt, _dir) = manager(MockRuntime::new());
        assert!(matches!(
            sandboxes.ensure_running("../etc").await,
            Err(SandboxError::InvalidProject(_))
        ));
        assert_eq!(rt.create_count(), 0);
    }

    #[tokio::test]
    async fn list_reports_project_ids() {
        let (sandboxes, _rt, _dir) = manager(MockRuntime::new());
        sandboxes.ensure_running("a").await.unwrap();
        sandboxes.ensure_running("b").await.unwrap();
        let all = sandboxes.list().await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.project_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(all.iter().all(|s| s.state == SandboxState::Running));
    }
}
