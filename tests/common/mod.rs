//! In-process server harness for the integration tests.
#![allow(dead_code)]

use collabd::broadcast::LocalBus;
use collabd::files::Workspace;
use collabd::http_server::build_router;
use collabd::identity::JwtIdentity;
use collabd::lock::LOCK_TTL;
use collabd::metadata::{MetadataStore, NullMetadataStore};
use collabd::sandbox::{MockRuntime, SandboxConfig};
use collabd::state::{AppState, Components};
use collabd::store::MemoryStore;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub runtime: Arc<MockRuntime>,
    jwt: JwtIdentity,
    server: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_runtime(MockRuntime::new()).await
    }

    pub async fn with_runtime(runtime: MockRuntime) -> Self {
        Self::with_parts(runtime, Arc::new(NullMetadataStore)).await
    }

    pub async fn with_parts(runtime: MockRuntime, metadata: Arc<dyn MetadataStore>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(runtime);
        let state = AppState::new(Components {
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(LocalBus::new()),
            runtime: runtime.clone(),
            identity: Arc::new(JwtIdentity::new(SECRET)),
            metadata,
            workspace: Workspace::new(dir.path()),
            sandbox: SandboxConfig {
                exec_warmup: Duration::ZERO,
                ..SandboxConfig::default()
            },
            lock_ttl: LOCK_TTL,
        });
        let app = build_router(state.clone(), &["http://localhost:3000".to_string()]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            runtime,
            jwt: JwtIdentity::new(SECRET),
            server,
            _dir: dir,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        self.jwt.issue(user_id, Duration::from_secs(600)).unwrap()
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, path_and_query: &str) -> String {
        format!("ws://{}{}", self.addr, path_and_query)
    }

    /// Status of an authenticated GET.
    pub async fn get_status(&self, user_id: &str, path: &str) -> u16 {
        reqwest::Client::new()
            .get(self.http(path))
            .bearer_auth(self.token(user_id))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    }

    /// Authenticated GET returning the JSON body.
    pub async fn get_json(&self, user_id: &str, path: &str) -> Value {
        let response = reqwest::Client::new()
            .get(self.http(path))
            .bearer_auth(self.token(user_id))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "GET {path}: {}", response.status());
        response.json().await.unwrap()
    }

    pub async fn editor(&self, user_id: &str) -> Editor {
        let url = self.ws(&format!("/editor?token={}", self.token(user_id)));
        let (socket, _) = connect_async(url).await.unwrap();
        Editor { socket }
    }

    pub async fn terminal(&self, user_id: &str, project_id: &str) -> Socket {
        let url = self.ws(&format!(
            "/terminal?projectId={project_id}&token={}",
            self.token(user_id)
        ));
        connect_async(url).await.unwrap().0
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Editor socket speaking `{"event", "data"}` frames.
pub struct Editor {
    socket: Socket,
}

impl Editor {
    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({"event": event, "data": data}).to_string();
        self.socket.send(Message::Text(frame)).await.unwrap();
    }

    /// Next event named `name`, skipping everything before it.
    pub async fn wait_for(&mut self, name: &str) -> Value {
        timeout(WAIT, async {
            loop {
                let msg = self
                    .socket
                    .next()
                    .await
                    .expect("socket closed")
                    .expect("socket error");
                if let Message::Text(text) = msg {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["event"] == name {
                        return frame["data"].clone();
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
    }

    /// Next `ack` for `op`.
    pub async fn acked(&mut self, op: &str) {
        while self.wait_for("ack").await["op"] != op {}
    }

    pub async fn close(mut self) {
        self.socket.close(None).await.unwrap();
        // Drain until the server finishes the close handshake.
        while let Some(Ok(_)) = self.socket.next().await {}
    }
}

/// Poll `check` until it holds or the wait runs out.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}
