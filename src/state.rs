//! Shared application state.

use crate::broadcast::{EventBus, LocalBus, RedisBus};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::files::Workspace;
use crate::identity::{IdentityProvider, JwtIdentity};
use crate::lock::LockManager;
use crate::metadata::{HttpMetadataStore, MetadataStore, NullMetadataStore, ProjectAccess};
use crate::presence::PresenceRegistry;
use crate::sandbox::{ContainerRuntime, DockerCli, SandboxConfig, SandboxManager};
use crate::store::{MemoryStore, RedisStore, StateStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Everything a request handler or session needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub events: Arc<dyn EventBus>,
    pub presence: Arc<PresenceRegistry>,
    pub locks: Arc<LockManager>,
    pub sandboxes: Arc<SandboxManager>,
    pub workspace: Workspace,
    pub identity: Arc<dyn IdentityProvider>,
    pub metadata: Arc<dyn MetadataStore>,
    pub started_at: Instant,
}

/// Pieces [`AppState::new`] wires together.
pub struct Components {
    pub store: Arc<dyn StateStore>,
    pub events: Arc<dyn EventBus>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub identity: Arc<dyn IdentityProvider>,
    pub metadata: Arc<dyn MetadataStore>,
    pub workspace: Workspace,
    pub sandbox: SandboxConfig,
    pub lock_ttl: Duration,
}

impl AppState {
    pub fn new(c: Components) -> Self {
        let presence = Arc::new(PresenceRegistry::new(c.store.clone(), c.events.clone()));
        let locks = Arc::new(LockManager::new(c.store.clone(), c.events.clone(), c.lock_ttl));
        let sandboxes = Arc::new(SandboxManager::new(c.runtime, c.workspace.clone(), c.sandbox));
        Self {
            store: c.store,
            events: c.events,
            presence,
            locks,
            sandboxes,
            workspace: c.workspace,
            identity: c.identity,
            metadata: c.metadata,
            started_at: Instant::now(),
        }
    }

    /// Connect the configured backends.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (store, events): (Arc<dyn StateStore>, Arc<dyn EventBus>) = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::connect(url).await?;
                let bus = RedisBus::connect(url).await.map_err(crate::store::StoreError::from)?;
                (Arc::new(store), Arc::new(bus))
            }
            None => {
                info!("no REDIS_URL; state is local to this process");
                (Arc::new(MemoryStore::new()), Arc::new(LocalBus::new()))
            }
        };
        let metadata: Arc<dyn MetadataStore> =
            if config.metadata_url.is_none() && config.access_url.is_none() {
                info!("no metadata service; every user may open every project");
                Arc::new(NullMetadataStore)
            } else {
                Arc::new(HttpMetadataStore::new(
                    config.metadata_url.clone(),
                    config.access_url.as_deref(),
                )?)
            };
        let workspace = Workspace::new(&config.workspace_root);
        tokio::fs::create_dir_all(workspace.root()).await?;
        info!(
            store = store.backend(),
            workspace = %workspace.root().display(),
            "state initialised"
        );

        Ok(Self::new(Components {
            store,
            events,
            runtime: Arc::new(DockerCli::new(&config.docker_bin)),
            identity: Arc::new(JwtIdentity::new(&config.jwt_secret)),
            metadata,
            workspace,
            sandbox: config.sandbox.clone(),
            lock_ttl: config.lock_ttl,
        }))
    }

    /// Fail unless `user_id` may work in `project_id`.
    pub async fn authorize(&self, project_id: &str, user_id: &str) -> Result<()> {
        match self.metadata.project_access(project_id, user_id).await? {
            ProjectAccess::Granted => Ok(()),
            ProjectAccess::Denied => Err(Error::Forbidden(format!(
                "{user_id} is not a member of project {project_id}"
            ))),
            ProjectAccess::UnknownProject => Err(Error::ProjectNotFound(project_id.to_string())),
        }
    }
}
