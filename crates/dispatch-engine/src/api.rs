//! REST surface: admission endpoint, health/stats, and CRUD for
//! projects, trunks, campaigns, and the blacklist.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::EngineError;
use crate::models::{BlacklistEntry, Project, Trunk};
use crate::originator::{DialRequest, Originator};
use crate::pool::ChannelPool;
use crate::tracker::ActiveCallTracker;

pub struct ApiState {
    pub originator: Arc<Originator>,
    pub pool: Arc<ChannelPool>,
    pub tracker: Arc<ActiveCallTracker>,
    pub db: Arc<crate::db::DatabaseManager>,
    /// Bearer tokens authorized to call the management endpoints. Empty
    /// means auth is disabled, matching an unconfigured dev instance.
    pub bearer_tokens: Vec<String>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/call", post(place_call))
        .route("/api/v1/proyectos", get(list_projects).post(create_project))
        .route("/api/v1/proyectos/:id", axum::routing::delete(delete_project))
        .route("/api/v1/troncales", get(list_trunks).post(create_trunk))
        .route("/api/v1/troncales/:id", axum::routing::delete(delete_trunk))
        .route("/api/v1/blacklist/:project_id", get(list_blacklist).post(add_blacklist))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<ApiState>) -> std::io::Result<()> {
    let app = router(state);
    info!(%addr, "api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct Stats {
    global_free: u32,
    in_flight: usize,
}

async fn stats(State(state): State<Arc<ApiState>>) -> Json<Stats> {
    Json(Stats {
        global_free: state.pool.global_free(),
        in_flight: state.tracker.len(),
    })
}

#[derive(Deserialize)]
struct CallRequest {
    project_id: i64,
    phone: String,
}

#[derive(Serialize)]
struct CallAccepted {
    call_log_id: i64,
    correlation_id: String,
    trunk: String,
}

async fn place_call(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Result<(StatusCode, Json<CallAccepted>), ApiError> {
    require_bearer(&state, &headers)?;
    authorize_ip(&state, req.project_id, &headers).await?;

    let admitted = state
        .originator
        .dial(DialRequest {
            project_id: req.project_id,
            phone: req.phone,
            campaign_id: None,
            contact_id: None,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CallAccepted {
            call_log_id: admitted.call_log_id,
            correlation_id: admitted.correlation_id,
            trunk: admitted.trunk,
        }),
    ))
}

async fn list_projects(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.db.list_projects().await?))
}

async fn create_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(project): Json<Project>,
) -> Result<Json<i64>, ApiError> {
    require_bearer(&state, &headers)?;
    Ok(Json(state.db.insert_project(&project).await?))
}

async fn delete_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    require_bearer(&state, &headers)?;
    state.db.delete_project(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_trunks(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Trunk>>, ApiError> {
    Ok(Json(state.db.list_trunks().await?))
}

async fn create_trunk(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(trunk): Json<Trunk>,
) -> Result<Json<i64>, ApiError> {
    require_bearer(&state, &headers)?;
    let id = state.db.insert_trunk(&trunk).await?;
    state.pool.register_trunk(trunk.name.clone(), trunk.max_channels);
    Ok(Json(id))
}

async fn delete_trunk(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    require_bearer(&state, &headers)?;
    state.db.delete_trunk(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_blacklist(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<BlacklistEntry>>, ApiError> {
    Ok(Json(state.db.list_blacklist(project_id).await?))
}

async fn add_blacklist(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
    Json(mut entry): Json<BlacklistEntry>,
) -> Result<StatusCode, ApiError> {
    require_bearer(&state, &headers)?;
    entry.project_id = project_id;
    state.db.add_to_blacklist(&entry).await?;
    Ok(StatusCode::CREATED)
}

fn require_bearer(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.bearer_tokens.is_empty() {
        return Ok(());
    }
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(t) if state.bearer_tokens.iter().any(|known| known == t) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn authorize_ip(state: &ApiState, project_id: i64, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(project) = state.db.get_project(project_id).await? else {
        return Err(ApiError::Engine(EngineError::UnknownProject(project_id)));
    };
    if project.authorized_ips.is_empty() {
        return Ok(());
    }
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match client_ip {
        Some(ip) if project.authorized_ips.iter().any(|allowed| allowed == &ip) => Ok(()),
        Some(ip) => Err(ApiError::Engine(EngineError::IpNotAuthorized(ip))),
        None => Ok(()), // no proxy header present; trust the transport layer
    }
}

enum ApiError {
    Unauthorized,
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token".to_string()),
            ApiError::Engine(e) => (status_for(&e), e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::GlobalFull | EngineError::TrunkFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Blacklisted(_) | EngineError::InvalidPhone(_) | EngineError::IpNotAuthorized(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::UnknownProject(_) | EngineError::NoTrunkAvailable(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
