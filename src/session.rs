//! Editor sessions: one per WebSocket connection on `/editor`.
//!
//! A session turns client requests into presence, lock and file operations,
//! answers each request exactly once, and forwards events of the rooms it
//! joined. When the connection goes away it releases every lock its user
//! holds and leaves every room it joined.

use crate::error::{Error, Result};
use crate::events::{
    ClientRequest, FileLocked, FilePath, InitialFileLocks, InitialFileUsers, InitialUsers,
    LockDenied, PresentUser, ReadFileSuccess, Room, ServerEvent, TransferDenied, TreePath,
};
use crate::lock::{AcquireOutcome, Resource};
use crate::metadata::FileRecord;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events queued for one connection before senders wait.
const OUTBOUND_DEPTH: usize = 256;

pub struct EditorSession {
    state: AppState,
    user_id: String,
    connection_id: String,
    outbound: mpsc::Sender<ServerEvent>,
    /// Joined rooms and the task forwarding each room's events.
    rooms: HashMap<Room, JoinHandle<()>>,
    /// Projects this connection was admitted to. Checked once per project
    /// per connection; a revoked member keeps access until reconnecting.
    admitted: HashSet<String>,
}

impl EditorSession {
    pub fn new(state: AppState, user_id: String, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            state,
            user_id,
            connection_id: uuid::Uuid::new_v4().to_string(),
            outbound,
            rooms: HashMap::new(),
            admitted: HashSet::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Handle one text frame, queueing the reply. Returns `false` once the
    /// connection can no longer be written to.
    pub async fn handle_frame(&mut self, text: &str) -> bool {
        let mut request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "unreadable request");
                return self.send(ServerEvent::error(None, format!("invalid request: {e}"))).await;
            }
        };
        let op = request.op();
        if let Err(reason) = request.normalize() {
            return self.send(ServerEvent::error(Some(op), reason)).await;
        }
        debug!(connection_id = %self.connection_id, user_id = %self.user_id, op, "request");
        match self.dispatch(request).await {
            Ok(replies) => {
                for reply in replies {
                    if !self.send(reply).await {
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                match &e {
                    Error::Conflict(_)
                    | Error::InvalidRequest(_)
                    | Error::Forbidden(_)
                    | Error::ProjectNotFound(_) => {
                        debug!(op, error = %e, "request refused")
                    }
                    _ => error!(op, user_id = %self.user_id, error = %e, "request failed"),
                }
                self.send(ServerEvent::error(Some(op), e.to_string())).await
            }
        }
    }

    async fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).await.is_ok()
    }

    async fn admit(&mut self, project_id: &str) -> Result<()> {
        if self.admitted.contains(project_id) {
            return Ok(());
        }
        self.state.authorize(project_id, &self.user_id).await?;
        self.admitted.insert(project_id.to_string());
        Ok(())
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<Vec<ServerEvent>> {
        let op = request.op();
        self.admit(request.project_id()).await?;
        match request {
            ClientRequest::JoinProjectRoom(p) => {
                let room = Room::project(&p.project_id);
                self.subscribe(&room);
                let members = self
                    .state
                    .presence
                    .join(&room, &self.user_id, &self.connection_id)
                    .await?;
                let file_locks = self.state.locks.project_locks(&p.project_id).await?;
                Ok(vec![
                    ServerEvent::InitialFileLocks(InitialFileLocks {
                        project_id: p.project_id.clone(),
                        file_locks,
                    }),
                    ServerEvent::InitialUsers(InitialUsers {
                        project_id: p.project_id,
                        users: present_users(members),
                    }),
                ])
            }
            ClientRequest::LeaveProjectRoom(p) => {
                let room = Room::project(&p.project_id);
                self.state
                    .presence
                    .leave(&room, &self.user_id, &self.connection_id)
                    .await?;
                self.unsubscribe(&room);
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::JoinFileRoom(f) => {
                let resource = Resource::new(&f.project_id, &f.file_path);
                let room = resource.room();
                self.subscribe(&room);
                let members = self
                    .state
                    .presence
                    .join(&room, &self.user_id, &self.connection_id)
                    .await?;
                let mut replies = Vec::with_capacity(2);
                if let Some(holder) = self.state.locks.holder(&resource).await? {
                    replies.push(ServerEvent::FileLocked(FileLocked {
                        file_path: f.file_path.clone(),
                        user_id: holder,
                    }));
                }
                replies.push(ServerEvent::InitialFileUsers(InitialFileUsers {
                    file_path: f.file_path,
                    users: present_users(members),
                }));
                Ok(replies)
            }
            ClientRequest::LeaveFileRoom(f) => {
                let resource = Resource::new(&f.project_id, &f.file_path);
                let room = resource.room();
                self.state.locks.release(&resource, &self.user_id).await?;
                self.state
                    .presence
                    .leave(&room, &self.user_id, &self.connection_id)
                    .await?;
                self.unsubscribe(&room);
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::LockFile(f) => {
                let resource = Resource::new(&f.project_id, &f.file_path);
                match self.state.locks.acquire(&resource, &self.user_id).await? {
                    AcquireOutcome::Acquired { .. } => Ok(vec![ServerEvent::ack(op)]),
                    AcquireOutcome::HeldBy(holder) => {
                        Ok(vec![ServerEvent::LockDenied(LockDenied {
                            file_path: f.file_path,
                            holder_user_id: holder,
                        })])
                    }
                }
            }
            ClientRequest::UnlockFile(f) => {
                let resource = Resource::new(&f.project_id, &f.file_path);
                self.state.locks.release(&resource, &self.user_id).await?;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::TransferLock(t) => {
                let resource = Resource::new(&t.project_id, &t.file_path);
                match self
                    .state
                    .locks
                    .transfer(&resource, &self.user_id, &t.to_user_id)
                    .await?
                {
                    Ok(()) => Ok(vec![ServerEvent::ack(op)]),
                    Err(denial) => Ok(vec![ServerEvent::TransferDenied(TransferDenied {
                        file_path: t.file_path,
                        reason: denial.reason().to_string(),
                    })]),
                }
            }
            ClientRequest::RequestLock(f) => {
                let resource = Resource::new(&f.project_id, &f.file_path);
                self.state
                    .locks
                    .request_transfer(&resource, &self.user_id)
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::WriteFile(w) => {
                let resource = Resource::new(&w.project_id, &w.file_path);
                if let Some(holder) = self.state.locks.holder(&resource).await? {
                    if holder != self.user_id {
                        return Err(Error::Conflict(format!(
                            "{} is locked by {holder}",
                            w.file_path
                        )));
                    }
                }
                self.state
                    .workspace
                    .write(&w.project_id, &w.file_path, &w.data)
                    .await?;
                self.state
                    .events
                    .publish(
                        &resource.room(),
                        ServerEvent::WriteFileSuccess(FilePath {
                            file_path: w.file_path,
                        }),
                    )
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::ReadFile(f) => {
                let (value, extension) = self.state.workspace.read(&f.project_id, &f.file_path).await?;
                Ok(vec![ServerEvent::ReadFileSuccess(ReadFileSuccess {
                    file_path: f.file_path,
                    value,
                    extension,
                })])
            }
            ClientRequest::CreateFile(f) => {
                self.state
                    .workspace
                    .create_file(&f.project_id, &f.file_path)
                    .await?;
                let record = FileRecord::new(&f.project_id, &f.file_path, &self.user_id);
                if let Err(e) = self.state.metadata.register_file(&record).await {
                    warn!(path = %f.file_path, error = %e, "file created but not registered");
                }
                self.announce(&f.project_id, ServerEvent::FileCreated(TreePath { path: f.file_path }))
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::DeleteFile(f) => {
                self.state
                    .workspace
                    .delete_file(&f.project_id, &f.file_path)
                    .await?;
                self.announce(&f.project_id, ServerEvent::FileDeleted(TreePath { path: f.file_path }))
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::CreateFolder(f) => {
                self.state
                    .workspace
                    .create_folder(&f.project_id, &f.file_path)
                    .await?;
                self.announce(&f.project_id, ServerEvent::FolderCreated(TreePath { path: f.file_path }))
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
            ClientRequest::DeleteFolder(f) => {
                self.state
                    .workspace
                    .delete_folder(&f.project_id, &f.file_path)
                    .await?;
                self.announce(&f.project_id, ServerEvent::FolderDeleted(TreePath { path: f.file_path }))
                    .await;
                Ok(vec![ServerEvent::ack(op)])
            }
        }
    }

    async fn announce(&self, project_id: &str, event: ServerEvent) {
        self.state
            .events
            .publish(&Room::project(project_id), event)
            .await;
    }

    /// Start forwarding `room` to this connection. Joining twice keeps the
    /// first forwarder so events are not duplicated.
    fn subscribe(&mut self, room: &Room) {
        if self.rooms.contains_key(room) {
            return;
        }
        let mut events = self.state.events.subscribe(room);
        let outbound = self.outbound.clone();
        let connection_id = self.connection_id.clone();
        let name = room.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if outbound.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%connection_id, room = %name, skipped, "session lagging; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.rooms.insert(room.clone(), forwarder);
    }

    fn unsubscribe(&mut self, room: &Room) {
        if let Some(forwarder) = self.rooms.remove(room) {
            forwarder.abort();
        }
    }

    /// Disconnect cleanup. Runs to completion on a best-effort basis; one
    /// failing step does not stop the others.
    pub async fn close(mut self) {
        let rooms: Vec<Room> = self.rooms.keys().cloned().collect();
        for room in &rooms {
            self.unsubscribe(room);
        }

        match self.state.locks.release_all_held_by(&self.user_id).await {
            Ok(released) => debug!(user_id = %self.user_id, count = released.len(), "locks released on disconnect"),
            Err(e) => warn!(user_id = %self.user_id, error = %e, "lock cleanup failed; TTL will reap"),
        }

        for room in &rooms {
            if let Err(e) = self
                .state
                .presence
                .leave(room, &self.user_id, &self.connection_id)
                .await
            {
                warn!(user_id = %self.user_id, %room, error = %e, "presence cleanup failed");
            }
        }
        info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            rooms = rooms.len(),
            "editor session closed"
        );
    }
}

fn present_users(members: BTreeSet<String>) -> Vec<PresentUser> {
    members
        .into_iter()
        .map(|user_id| PresentUser { user_id })
        .collect()
}

/// Drive an editor session over an upgraded socket.
pub async fn serve(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "cannot encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = EditorSession::new(state, user_id, tx);
    info!(connection_id = %session.connection_id(), "editor session opened");
    while let Some(frame) = ws_rx.next().await {
        let keep_going = match frame {
            Ok(Message::Text(text)) => session.handle_frame(&text).await,
            Ok(Message::Binary(_)) => {
                session
                    .send(ServerEvent::error(None, "binary frames are not supported"))
                    .await
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => true,
            Ok(Message::Close(_)) => false,
            Err(e) => {
                debug!(error = %e, "editor socket read failed");
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    session.close().await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBus;
    use crate::files::Workspace;
    use crate::identity::JwtIdentity;
    use crate::lock::LOCK_TTL;
    use crate::metadata::{MemoryMetadataStore, MetadataStore, NullMetadataStore};
    use crate::sandbox::{MockRuntime, SandboxConfig};
    use crate::state::Components;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn app(dir: &tempfile::TempDir) -> AppState {
        app_with(dir, Arc::new(NullMetadataStore))
    }

    fn app_with(dir: &tempfile::TempDir, metadata: Arc<dyn MetadataStore>) -> AppState {
        AppState::new(Components {
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(LocalBus::new()),
            runtime: Arc::new(MockRuntime::new()),
            identity: Arc::new(JwtIdentity::new("secret")),
            metadata,
            workspace: Workspace::new(dir.path()),
            sandbox: SandboxConfig::default(),
            lock_ttl: LOCK_TTL,
        })
    }

    struct Client {
        session: EditorSession,
        rx: mpsc::Receiver<ServerEvent>,
    }

    impl Client {
        fn new(state: &AppState, user: &str) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                session: EditorSession::new(state.clone(), user.to_string(), tx),
                rx,
            }
        }

        async fn send(&mut self, event: &str, data: serde_json::Value) {
            let frame = json!({"event": event, "data": data}).to_string();
            assert!(self.session.handle_frame(&frame).await);
        }

        /// Next event matching `pred`, skipping others.
        async fn expect(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("session channel closed");
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn join_project_replies_with_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        a.send("joinProjectRoom", json!({"projectId": "p1"})).await;

        let locks = a.expect(|e| matches!(e, ServerEvent::InitialFileLocks(_))).await;
        assert!(matches!(locks, ServerEvent::InitialFileLocks(l) if l.file_locks.is_empty()));
        let users = a.expect(|e| matches!(e, ServerEvent::InitialUsers(_))).await;
        match users {
            ServerEvent::InitialUsers(u) => {
                assert_eq!(u.users, vec![PresentUser { user_id: "alice".into() }])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn lock_conflict_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let mut b = Client::new(&state, "bob");
        let file = json!({"projectId": "p1", "filePath": "a.txt"});

        a.send("lockFile", file.clone()).await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "lockFile")).await;
        b.send("lockFile", file).await;
        let denied = b.expect(|e| matches!(e, ServerEvent::LockDenied(_))).await;
        assert_eq!(
            denied,
            ServerEvent::LockDenied(LockDenied {
                file_path: "a.txt".into(),
                holder_user_id: "alice".into()
            })
        );
    }

    #[tokio::test]
    async fn write_refused_while_locked_by_other() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let mut b = Client::new(&state, "bob");
        a.send("lockFile", json!({"projectId": "p1", "filePath": "a.txt"})).await;

        b.send("writeFile", json!({"projectId": "p1", "filePath": "a.txt", "data": "x"}))
            .await;
        let err = b.expect(|e| matches!(e, ServerEvent::Error(_))).await;
        assert!(matches!(err, ServerEvent::Error(p) if p.op.as_deref() == Some("writeFile")));

        a.send("writeFile", json!({"projectId": "p1", "filePath": "a.txt", "data": "mine"}))
            .await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "writeFile")).await;
        assert_eq!(state.workspace.read("p1", "a.txt").await.unwrap().0, "mine");
    }

    #[tokio::test]
    async fn file_room_join_shows_current_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let mut b = Client::new(&state, "bob");
        let file = json!({"projectId": "p1", "filePath": "a.txt"});
        a.send("joinFileRoom", file.clone()).await;
        a.send("lockFile", file.clone()).await;

        b.send("joinFileRoom", file).await;
        let locked = b.expect(|e| matches!(e, ServerEvent::FileLocked(_))).await;
        assert!(matches!(locked, ServerEvent::FileLocked(l) if l.user_id == "alice"));
        let users = b.expect(|e| matches!(e, ServerEvent::InitialFileUsers(_))).await;
        assert!(matches!(users, ServerEvent::InitialFileUsers(u) if u.users.len() == 2));
    }

    #[tokio::test]
    async fn leaving_file_room_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let file = json!({"projectId": "p1", "filePath": "a.txt"});
        a.send("joinFileRoom", file.clone()).await;
        a.send("lockFile", file.clone()).await;
        a.send("leaveFileRoom", file).await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "leaveFileRoom")).await;
        assert_eq!(
            state.locks.holder(&Resource::new("p1", "a.txt")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn transfer_denial_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        a.send("lockFile", json!({"projectId": "p1", "filePath": "a.txt"})).await;
        a.send(
            "transferLock",
            json!({"projectId": "p1", "filePath": "a.txt", "toUserId": "bob"}),
        )
        .await;
        let denied = a.expect(|e| matches!(e, ServerEvent::TransferDenied(_))).await;
        assert!(matches!(denied, ServerEvent::TransferDenied(d) if d.reason == "target not connected"));
    }

    #[tokio::test]
    async fn invalid_requests_get_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        assert!(a.session.handle_frame("not json").await);
        assert!(matches!(a.expect(|_| true).await, ServerEvent::Error(p) if p.op.is_none()));

        a.send("readFile", json!({"projectId": "p1", "filePath": "../secret"}))
            .await;
        assert!(matches!(
            a.expect(|_| true).await,
            ServerEvent::Error(p) if p.op.as_deref() == Some("readFile")
        ));
    }

    #[tokio::test]
    async fn file_operations_announce_to_project_room() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let mut b = Client::new(&state, "bob");
        b.send("joinProjectRoom", json!({"projectId": "p1"})).await;

        a.send("createFile", json!({"projectId": "p1", "filePath": "src/new.ts"}))
            .await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "createFile")).await;
        let created = b.expect(|e| matches!(e, ServerEvent::FileCreated(_))).await;
        assert_eq!(created, ServerEvent::FileCreated(TreePath { path: "src/new.ts".into() }));

        a.send("readFile", json!({"projectId": "p1", "filePath": "src/new.ts"}))
            .await;
        let read = a.expect(|e| matches!(e, ServerEvent::ReadFileSuccess(_))).await;
        assert!(matches!(read, ServerEvent::ReadFileSuccess(r) if r.extension == ".ts" && r.value.is_empty()));
    }

    #[tokio::test]
    async fn close_releases_locks_and_presence() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        a.send("joinProjectRoom", json!({"projectId": "p1"})).await;
        a.send("joinFileRoom", json!({"projectId": "p1", "filePath": "x"})).await;
        a.send("lockFile", json!({"projectId": "p1", "filePath": "x"})).await;
        assert!(state
            .locks
            .holder(&Resource::new("p1", "x"))
            .await
            .unwrap()
            .is_some());

        a.session.close().await;

        assert_eq!(state.locks.holder(&Resource::new("p1", "x")).await.unwrap(), None);
        assert!(!state
            .presence
            .is_present(&Room::project("p1"), "alice")
            .await
            .unwrap());
        assert!(!state
            .presence
            .is_present(&Room::file("p1", "x"), "alice")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn path_spellings_share_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut a = Client::new(&state, "alice");
        let mut b = Client::new(&state, "bob");
        a.send("lockFile", json!({"projectId": "p1", "filePath": "a.txt"})).await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "lockFile")).await;

        for spelling in ["./a.txt", "/a.txt", "/./a.txt"] {
            b.send("lockFile", json!({"projectId": "p1", "filePath": spelling}))
                .await;
            let denied = b.expect(|_| true).await;
            assert_eq!(
                denied,
                ServerEvent::LockDenied(LockDenied {
                    file_path: "a.txt".into(),
                    holder_user_id: "alice".into()
                }),
                "{spelling:?}"
            );

            b.send(
                "writeFile",
                json!({"projectId": "p1", "filePath": spelling, "data": "overwrite"}),
            )
            .await;
            let refused = b.expect(|_| true).await;
            assert!(
                matches!(&refused, ServerEvent::Error(p) if p.op.as_deref() == Some("writeFile")),
                "{spelling:?}: {refused:?}"
            );
        }
        assert!(state.workspace.read("p1", "a.txt").await.is_err());
        assert_eq!(state.locks.project_locks("p1").await.unwrap().len(), 1);

        a.send("writeFile", json!({"projectId": "p1", "filePath": "./a.txt", "data": "mine"}))
            .await;
        a.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "writeFile")).await;
        assert_eq!(state.workspace.read("p1", "a.txt").await.unwrap().0, "mine");
    }

    #[tokio::test]
    async fn non_members_are_kept_out_of_projects() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.grant("p1", "alice");
        let state = app_with(&dir, metadata.clone());
        let mut mallory = Client::new(&state, "mallory");

        for (event, data) in [
            ("joinProjectRoom", json!({"projectId": "p1"})),
            ("lockFile", json!({"projectId": "p1", "filePath": "a.txt"})),
            ("createFile", json!({"projectId": "p1", "filePath": "a.txt"})),
            ("joinProjectRoom", json!({"projectId": "unknown"})),
        ] {
            mallory.send(event, data).await;
            let reply = mallory.expect(|_| true).await;
            assert!(
                matches!(&reply, ServerEvent::Error(p) if p.op.as_deref() == Some(event)),
                "{event}: {reply:?}"
            );
        }
        assert!(!state
            .presence
            .is_present(&Room::project("p1"), "mallory")
            .await
            .unwrap());
        assert!(state.locks.project_locks("p1").await.unwrap().is_empty());
        assert!(metadata.files().is_empty());

        let mut alice = Client::new(&state, "alice");
        alice.send("createFile", json!({"projectId": "p1", "filePath": "a.txt"}))
            .await;
        alice.expect(|e| matches!(e, ServerEvent::Ack(ack) if ack.op == "createFile")).await;
        assert_eq!(metadata.files()[0].last_edited_by, "alice");
    }
}
