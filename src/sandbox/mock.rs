//! In-memory container runtime for tests.
//!
//! Containers are plain records; an exec session is a loopback that echoes
//! every byte written to it and keeps a copy of everything it received.

use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, RuntimeError,
    RuntimeResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const FIRST_HOST_PORT: u16 = 40000;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    host_port: Option<u16>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    next_port: u16,
}

impl MockState {
    fn find(&self, name_or_id: &str) -> Option<&MockContainer> {
        self.containers
            .get(name_or_id)
            .or_else(|| self.containers.values().find(|c| c.id == name_or_id))
    }

    fn find_mut(&mut self, name_or_id: &str) -> Option<&mut MockContainer> {
        let name = self.find(name_or_id).map(|c| c.spec.name.clone())?;
        self.containers.get_mut(&name)
    }
}

fn info(c: &MockContainer) -> ContainerInfo {
    let mut ports = HashMap::new();
    if let Some(host_port) = c.host_port {
        ports.insert(c.spec.service_port, host_port);
    }
    ContainerInfo {
        id: c.id.clone(),
        name: c.spec.name.clone(),
        running: c.running,
        ports,
    }
}

/// Mock runtime for testing.
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    creates: AtomicUsize,
    execs: AtomicUsize,
    exec_input: Arc<Mutex<Vec<u8>>>,
    /// Delay inside `create`, widening the window for concurrent callers.
    pub create_delay_ms: u64,
    /// If true, `create` fails.
    pub fail_create: bool,
    /// Bytes an exec session emits as soon as it opens.
    pub exec_banner: Vec<u8>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                containers: HashMap::new(),
                next_port: FIRST_HOST_PORT,
            })),
            creates: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            exec_input: Arc::new(Mutex::new(Vec::new())),
            create_delay_ms: 0,
            fail_create: false,
            exec_banner: Vec::new(),
        }
    }

    /// A runtime whose `create` always fails.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    pub fn with_create_delay(delay_ms: u64) -> Self {
        Self {
            create_delay_ms: delay_ms,
            ..Self::new()
        }
    }

    /// Number of successful `create` calls.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of exec sessions opened.
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Everything written to any exec session's stdin, in order.
    pub async fn exec_input(&self) -> Vec<u8> {
        self.exec_input.lock().await.clone()
    }

    /// Spec a container was created with.
    pub async fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.state.lock().await.find(name).map(|c| c.spec.clone())
    }

    /// Stop a container, dropping its port mapping.
    pub async fn stop(&self, name_or_id: &str) {
        if let Some(c) = self.state.lock().await.find_mut(name_or_id) {
            c.running = false;
            c.host_port = None;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, name_or_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        Ok(self.state.lock().await.find(name_or_id).map(info))
    }

    async fn list(&self, prefix: &str) -> RuntimeResult<Vec<ContainerInfo>> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state
            .containers
            .values()
            .filter(|c| c.spec.name.starts_with(prefix))
            .map(info)
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if self.create_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.create_delay_ms)).await;
        }
        if self.fail_create {
            return Err(RuntimeError::CommandFailed {
                command: "create".into(),
                status: 125,
                stderr: format!("mock refused to create {}", spec.name),
            });
        }
        let mut state = self.state.lock().await;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{n:04}");
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                host_port: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let port = state.next_port;
        let c = state
            .find_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if c.running {
            return Ok(());
        }
        c.running = true;
        c.host_port = Some(port);
        state.next_port += 1;
        Ok(())
    }

    async fn exec_interactive(&self, id: &str, _spec: &ExecSpec) -> RuntimeResult<ExecSession> {
        match self.state.lock().await.find(id) {
            Some(c) if c.running => {}
            Some(_) => {
                return Err(RuntimeError::CommandFailed {
                    command: "exec".into(),
                    status: 1,
                    stderr: format!("container {id} is not running"),
                })
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        }
        self.execs.fetch_add(1, Ordering::SeqCst);

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);
        let recorded = Arc::clone(&self.exec_input);
        let banner = self.exec_banner.clone();
        let echo = tokio::spawn(async move {
            if !banner.is_empty() && out_tx.send(Ok(banner)).await.is_err() {
                return;
            }
            while let Some(bytes) = in_rx.recv().await {
                recorded.lock().await.extend_from_slice(&bytes);
                if out_tx.send(Ok(bytes)).await.is_err() {
                    break;
                }
            }
        });
        Ok(ExecSession::new(out_rx, in_tx, move || echo.abort()))
    }
}
