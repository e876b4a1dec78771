//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::events::{validate_project_id, Room};
use crate::files::TreeNode;
use crate::identity::{extract_token, AuthError};
use crate::sandbox::{RunningSandbox, SandboxState, SandboxSummary};
use crate::state::AppState;
use crate::{session, terminal};
use axum::{
    async_trait,
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderValue, Method},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Interval of the expired-entry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Identity of the caller, resolved before the handler runs.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = extract_token(&parts.headers, parts.uri.query()).ok_or(AuthError::MissingToken)?;
        let user_id = state.identity.resolve(&token).await?;
        Ok(AuthUser(user_id))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct PortResponse {
    port: Option<u16>,
}

#[derive(Serialize)]
struct StateResponse {
    state: SandboxState,
}

#[derive(Serialize)]
struct PresenceResponse {
    users: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocksResponse {
    file_locks: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct TreeResponse {
    tree: Vec<TreeNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalQuery {
    project_id: String,
}

/// Build the application router.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/editor", get(editor_socket))
        .route("/terminal", get(terminal_socket))
        .route("/sandboxes", get(list_sandboxes))
        .route("/projects/:id/port", get(get_port))
        .route("/projects/:id/sandbox", get(sandbox_state).post(ensure_sandbox))
        .route("/projects/:id/presence", get(project_presence))
        .route("/projects/:id/locks", get(project_locks))
        .route("/projects/:id/tree", get(project_tree))
        .layer(TraceLayer::new_for_http())
        .layer(cors(allowed_origins))
        .with_state(state)
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Run the HTTP server until SIGINT/SIGTERM.
pub async fn run_server(addr: SocketAddr, allowed_origins: &[String], state: AppState) -> Result<()> {
    // Spawn sweep task
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut interval = interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let swept = store.sweep_expired().await;
            if swept > 0 {
                debug!(swept, "expired store entries dropped");
            }
        }
    });

    let app = build_router(state, allowed_origins);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested; draining connections");
}

/// Validate a project id and check the caller may work in it.
async fn project(state: &AppState, id: &str, user_id: &str) -> Result<()> {
    validate_project_id(id).map_err(Error::InvalidRequest)?;
    state.authorize(id, user_id).await
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn editor_socket(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state, user_id))
}

async fn terminal_socket(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    project(&state, &query.project_id, &user_id).await?;
    // The sandbox must be running before the connection is accepted.
    let sandbox = state.sandboxes.ensure_running(&query.project_id).await?;
    let sandboxes = state.sandboxes.clone();
    Ok(ws.on_upgrade(move |socket| terminal::serve(socket, sandboxes, sandbox, user_id)))
}

async fn get_port(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PortResponse>> {
    project(&state, &id, &user_id).await?;
    let port = state.sandboxes.get_port(&id).await?;
    Ok(Json(PortResponse { port }))
}

async fn ensure_sandbox(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunningSandbox>> {
    project(&state, &id, &user_id).await?;
    info!(project_id = %id, user_id = %user_id, "sandbox requested");
    Ok(Json(state.sandboxes.ensure_running(&id).await?))
}

async fn sandbox_state(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateResponse>> {
    project(&state, &id, &user_id).await?;
    let state = state.sandboxes.state(&id).await?;
    Ok(Json(StateResponse { state }))
}

async fn list_sandboxes(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<SandboxSummary>>> {
    // Only sandboxes of projects the caller may open.
    let mut visible = Vec::new();
    for sandbox in state.sandboxes.list().await? {
        match state.authorize(&sandbox.project_id, &user_id).await {
            Ok(()) => visible.push(sandbox),
            Err(Error::Forbidden(_) | Error::ProjectNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Json(visible))
}

async fn project_presence(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PresenceResponse>> {
    project(&state, &id, &user_id).await?;
    let users = state.presence.list(&Room::project(&id)).await?;
    Ok(Json(PresenceResponse {
        users: users.into_iter().collect(),
    }))
}

async fn project_locks(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LocksResponse>> {
    project(&state, &id, &user_id).await?;
    let file_locks = state.locks.project_locks(&id).await?;
    Ok(Json(LocksResponse { file_locks }))
}

async fn project_tree(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TreeResponse>> {
    project(&state, &id, &user_id).await?;
    let tree = state.workspace.tree(&id).await?;
    Ok(Json(TreeResponse { tree }))
}
