//! Wire types for the editor socket and the rooms events are addressed to.
//!
//! Frames are JSON objects `{"event": <name>, "data": <payload>}`. Each event
//! name has exactly one payload record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A room events are published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Project(String),
    File { project_id: String, file_path: String },
}

impl Room {
    pub fn project(project_id: impl Into<String>) -> Self {
        Room::Project(project_id.into())
    }

    pub fn file(project_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Room::File {
            project_id: project_id.into(),
            file_path: file_path.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Room::Project(id) => id,
            Room::File { project_id, .. } => project_id,
        }
    }

    /// Channel name used by the transport.
    pub fn channel(&self) -> String {
        match self {
            Room::Project(id) => format!("project:{id}"),
            Room::File { project_id, file_path } => format!("file:{project_id}:{file_path}"),
        }
    }

    /// Presence-set key in the shared store.
    pub fn presence_key(&self) -> String {
        match self {
            Room::Project(id) => crate::store::keys::project_presence(id),
            Room::File { project_id, file_path } => {
                crate::store::keys::file_presence(project_id, file_path)
            }
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel())
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub project_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFile {
    pub project_id: String,
    pub file_path: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLock {
    pub project_id: String,
    pub file_path: String,
    pub to_user_id: String,
}

/// Requests a session may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    JoinProjectRoom(ProjectRef),
    LeaveProjectRoom(ProjectRef),
    JoinFileRoom(FileRef),
    LeaveFileRoom(FileRef),
    LockFile(FileRef),
    UnlockFile(FileRef),
    TransferLock(TransferLock),
    RequestLock(FileRef),
    WriteFile(WriteFile),
    ReadFile(FileRef),
    CreateFile(FileRef),
    DeleteFile(FileRef),
    CreateFolder(FileRef),
    DeleteFolder(FileRef),
}

impl ClientRequest {
    /// Event name of the request, echoed back in acknowledgements.
    pub fn op(&self) -> &'static str {
        match self {
            ClientRequest::JoinProjectRoom(_) => "joinProjectRoom",
            ClientRequest::LeaveProjectRoom(_) => "leaveProjectRoom",
            ClientRequest::JoinFileRoom(_) => "joinFileRoom",
            ClientRequest::LeaveFileRoom(_) => "leaveFileRoom",
            ClientRequest::LockFile(_) => "lockFile",
            ClientRequest::UnlockFile(_) => "unlockFile",
            ClientRequest::TransferLock(_) => "transferLock",
            ClientRequest::RequestLock(_) => "requestLock",
            ClientRequest::WriteFile(_) => "writeFile",
            ClientRequest::ReadFile(_) => "readFile",
            ClientRequest::CreateFile(_) => "createFile",
            ClientRequest::DeleteFile(_) => "deleteFile",
            ClientRequest::CreateFolder(_) => "createFolder",
            ClientRequest::DeleteFolder(_) => "deleteFolder",
        }
    }

    /// Project the request acts on.
    pub fn project_id(&self) -> &str {
        match self {
            ClientRequest::JoinProjectRoom(p) | ClientRequest::LeaveProjectRoom(p) => &p.project_id,
            ClientRequest::JoinFileRoom(f)
            | ClientRequest::LeaveFileRoom(f)
            | ClientRequest::LockFile(f)
            | ClientRequest::UnlockFile(f)
            | ClientRequest::RequestLock(f)
            | ClientRequest::ReadFile(f)
            | ClientRequest::CreateFile(f)
            | ClientRequest::DeleteFile(f)
            | ClientRequest::CreateFolder(f)
            | ClientRequest::DeleteFolder(f) => &f.project_id,
            ClientRequest::WriteFile(w) => &w.project_id,
            ClientRequest::TransferLock(t) => &t.project_id,
        }
    }

    /// Reject malformed identifiers before any handler runs and rewrite the
    /// file path into its canonical form, so every handler keys locks, rooms
    /// and files on the same string.
    pub fn normalize(&mut self) -> Result<(), String> {
        let (project_id, file_path, target) = match self {
            ClientRequest::JoinProjectRoom(p) | ClientRequest::LeaveProjectRoom(p) => {
                (&p.project_id, None, None)
            }
            ClientRequest::JoinFileRoom(f)
            | ClientRequest::LeaveFileRoom(f)
            | ClientRequest::LockFile(f)
            | ClientRequest::UnlockFile(f)
            | ClientRequest::RequestLock(f)
            | ClientRequest::ReadFile(f)
            | ClientRequest::CreateFile(f)
            | ClientRequest::DeleteFile(f)
            | ClientRequest::CreateFolder(f)
            | ClientRequest::DeleteFolder(f) => (&f.project_id, Some(&mut f.file_path), None),
            ClientRequest::WriteFile(w) => (&w.project_id, Some(&mut w.file_path), None),
            ClientRequest::TransferLock(t) => {
                (&t.project_id, Some(&mut t.file_path), Some(&t.to_user_id))
            }
        };
        validate_project_id(project_id)?;
        if target.is_some_and(|t| t.trim().is_empty()) {
            return Err("toUserId must not be empty".to_string());
        }
        if let Some(path) = file_path {
            *path = crate::files::canonical_path(path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Project ids name directories, containers and key segments.
pub fn validate_project_id(project_id: &str) -> Result<(), String> {
    if project_id.is_empty() || project_id.len() > 128 {
        return Err("projectId must be 1-128 characters".to_string());
    }
    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!("invalid projectId: {project_id}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMember {
    pub user_id: String,
    pub connection_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentUser {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialUsers {
    pub project_id: String,
    pub users: Vec<PresentUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialFileUsers {
    pub file_path: String,
    pub users: Vec<PresentUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialFileLocks {
    pub project_id: String,
    pub file_locks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocked {
    pub file_path: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePath {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequested {
    pub file_path: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDenied {
    pub file_path: String,
    pub holder_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDenied {
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreePath {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileSuccess {
    pub file_path: String,
    pub value: String,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub op: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
}

/// Events delivered to sessions, either as a reply or through a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    UserJoinedProject(Member),
    UserLeftProject(Member),
    UserJoinedFile(FileMember),
    UserLeftFile(FileMember),
    InitialUsers(InitialUsers),
    InitialFileUsers(InitialFileUsers),
    InitialFileLocks(InitialFileLocks),
    FileLocked(FileLocked),
    FileUnlocked(FilePath),
    FileLockRequested(LockRequested),
    LockDenied(LockDenied),
    TransferDenied(TransferDenied),
    FileCreated(TreePath),
    FileDeleted(TreePath),
    FolderCreated(TreePath),
    FolderDeleted(TreePath),
    WriteFileSuccess(FilePath),
    ReadFileSuccess(ReadFileSuccess),
    Ack(Ack),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn ack(op: &str) -> Self {
        ServerEvent::Ack(Ack { op: op.to_string() })
    }

    pub fn error(op: Option<&str>, data: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            data: data.into(),
            op: op.map(str::to_string),
        })
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoinedProject(_) => "userJoinedProject",
            ServerEvent::UserLeftProject(_) => "userLeftProject",
            ServerEvent::UserJoinedFile(_) => "userJoinedFile",
            ServerEvent::UserLeftFile(_) => "userLeftFile",
            ServerEvent::InitialUsers(_) => "initialUsers",
            ServerEvent::InitialFileUsers(_) => "initialFileUsers",
            ServerEvent::InitialFileLocks(_) => "initialFileLocks",
            ServerEvent::FileLocked(_) => "fileLocked",
            ServerEvent::FileUnlocked(_) => "fileUnlocked",
            ServerEvent::FileLockRequested(_) => "fileLockRequested",
            ServerEvent::LockDenied(_) => "lockDenied",
            ServerEvent::TransferDenied(_) => "transferDenied",
            ServerEvent::FileCreated(_) => "fileCreated",
            ServerEvent::FileDeleted(_) => "fileDeleted",
            ServerEvent::FolderCreated(_) => "folderCreated",
            ServerEvent::FolderDeleted(_) => "folderDeleted",
            ServerEvent::WriteFileSuccess(_) => "writeFileSuccess",
            ServerEvent::ReadFileSuccess(_) => "readFileSuccess",
            ServerEvent::Ack(_) => "ack",
            ServerEvent::Error(_) => "error",
        }
    }
}
