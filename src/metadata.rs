//! Durable project and file records kept by an external service: file
//! registration on creation, and who may work in a project.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("metadata service answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid metadata url: {0}")]
    InvalidUrl(String),
}

/// Answer of [`MetadataStore::project_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAccess {
    /// Owner or member of the project.
    Granted,
    Denied,
    UnknownProject,
}

/// Record registered when a file is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub path: String,
    pub project_id: String,
    pub last_edited_by: String,
}

impl FileRecord {
    pub fn new(project_id: &str, path: &str, user_id: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Self {
            name,
            path: path.to_string(),
            project_id: project_id.to_string(),
            last_edited_by: user_id.to_string(),
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn register_file(&self, record: &FileRecord) -> Result<(), MetadataError>;

    /// Whether `user_id` may join, edit and open terminals in `project_id`.
    async fn project_access(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<ProjectAccess, MetadataError>;
}

/// Talks to the metadata service over HTTP.
///
/// File records are posted as JSON to `records_url`. Access is answered by
/// `GET {access_url}/{projectId}/members/{userId}`: 2xx grants, 401/403
/// denies, 404 means the project does not exist. Without an access url every
/// authenticated user is granted.
pub struct HttpMetadataStore {
    client: reqwest::Client,
    records_url: Option<String>,
    access_url: Option<reqwest::Url>,
}

impl HttpMetadataStore {
    pub fn new(records_url: Option<String>, access_url: Option<&str>) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let access_url = access_url
            .map(|u| reqwest::Url::parse(u).map_err(|e| MetadataError::InvalidUrl(format!("{u}: {e}"))))
            .transpose()?;
        if access_url.as_ref().is_some_and(|u| u.cannot_be_a_base()) {
            return Err(MetadataError::InvalidUrl("access url cannot carry a path".into()));
        }
        Ok(Self {
            client,
            records_url,
            access_url,
        })
    }

    fn member_url(base: &reqwest::Url, project_id: &str, user_id: &str) -> Result<reqwest::Url, MetadataError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| MetadataError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .extend([project_id, "members", user_id]);
        Ok(url)
    }
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn register_file(&self, record: &FileRecord) -> Result<(), MetadataError> {
        let Some(url) = &self.records_url else {
            debug!(path = %record.path, "no records endpoint; record dropped");
            return Ok(());
        };
        let response = self.client.post(url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(path = %record.path, project_id = %record.project_id, "file registered");
        Ok(())
    }

    async fn project_access(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<ProjectAccess, MetadataError> {
        let Some(base) = &self.access_url else {
            return Ok(ProjectAccess::Granted);
        };
        let url = Self::member_url(base, project_id, user_id)?;
        let response = self.client.get(url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(ProjectAccess::Granted),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(ProjectAccess::Denied),
            StatusCode::NOT_FOUND => Ok(ProjectAccess::UnknownProject),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(project_id, user_id, %status, "access check failed");
                Err(MetadataError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Used when no metadata service is configured: records are dropped and
/// every authenticated user may work in every project.
pub struct NullMetadataStore;

#[async_trait]
impl MetadataStore for NullMetadataStore {
    async fn register_file(&self, record: &FileRecord) -> Result<(), MetadataError> {
        debug!(path = %record.path, "no metadata service; record dropped");
        Ok(())
    }

    async fn project_access(&self, _: &str, _: &str) -> Result<ProjectAccess, MetadataError> {
        Ok(ProjectAccess::Granted)
    }
}

/// In-process metadata store with explicit project membership. Projects
/// that were never granted to anyone are unknown.
#[derive(Default)]
pub struct MemoryMetadataStore {
    members: Mutex<HashMap<String, HashSet<String>>>,
    files: Mutex<Vec<FileRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `user_id` a member of `project_id`.
    pub fn grant(&self, project_id: &str, user_id: &str) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(project_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Records registered so far, oldest first.
    pub fn files(&self) -> Vec<FileRecord> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn register_file(&self, record: &FileRecord) -> Result<(), MetadataError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn project_access(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<ProjectAccess, MetadataError> {
        let members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match members.get(project_id) {
            None => ProjectAccess::UnknownProject,
            Some(users) if users.contains(user_id) => ProjectAccess::Granted,
            Some(_) => ProjectAccess::Denied,
        })
    }
}
