// =============================================================================
// MOBMIND CORE — api.rs
// «HTTP Surface of the Coordinator»
// =============================================================================
//
// Wire-слой: axum-роутер над актором-координатором. Тела — JSON,
// CORS пермиссивный (игровые клиенты ходят откуда угодно). Доменные
// ошибки отображаются в HTTP-статусы здесь, и только здесь.
//
// Админ-поверхность закрыта статическим bearer-токеном из env:
// токен не задан → 503, не совпал → 401.
// =============================================================================

use crate::coordinator::{self, CoordError, Coordinator, UploadAck, UploadRequest};
use crate::episodes::EpisodeRecord;
use crate::tiers::TierState;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub coord: Arc<Coordinator>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn from_env(coord: Arc<Coordinator>) -> Self {
        let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
        if admin_token.is_none() {
            log::warn!("ADMIN_TOKEN не задан — админ-поверхность отвечает 503");
        }
        AppState { coord, admin_token }
    }
}

// -----------------------------------------------------------------------------
// ApiError — отображение CoordError в HTTP
// -----------------------------------------------------------------------------

pub struct ApiError(pub CoordError);

impl From<CoordError> for ApiError {
    fn from(e: CoordError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            CoordError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Bad request", "message": message }),
            ),
            CoordError::AlreadyContributed { round } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "Already contributed",
                    "message": "submission already counted for this round",
                    "round": round,
                    "nextRound": round + 1,
                }),
            ),
            CoordError::NoGlobalModel { round } => (
                StatusCode::NOT_FOUND,
                json!({ "error": "No global model yet", "message": "no round has aggregated", "round": round }),
            ),
            CoordError::UnknownMobType(mob) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "Unknown mob type", "message": format!("mob type {} not in global model", mob), "mobType": mob }),
            ),
            CoordError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Unauthorized", "message": "invalid admin token" }),
            ),
            CoordError::AdminNotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Admin not configured", "message": "ADMIN_TOKEN is not set" }),
            ),
            CoordError::SinkNotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Log sink not configured", "message": "GITHUB_TOKEN / GITHUB_REPO are not set" }),
            ),
            CoordError::Sink(message) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "Log sink failure", "message": message }),
            ),
            CoordError::Storage(message) => {
                log::error!("💥 отказ хранилища: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Storage failure", "message": message }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/coordinator/upload", post(upload_handler))
        .route("/coordinator/global", get(global_handler))
        .route("/coordinator/status", get(status_handler))
        .route("/coordinator/heartbeat", post(heartbeat_handler))
        .route("/coordinator/flush-github", post(flush_handler))
        .route(
            "/coordinator/backfill-current-global",
            post(backfill_handler),
        )
        .route("/coordinator/admin/reset-round", post(admin_reset_handler))
        .route(
            "/coordinator/admin/backfill-current-global",
            post(admin_backfill_handler),
        )
        .route(
            "/coordinator/admin/mark-missing-round",
            post(admin_mark_missing_handler),
        )
        .route("/coordinator/tiers/upload", post(tiers_upload_handler))
        .route("/coordinator/tiers/download", get(tiers_download_handler))
        .route("/coordinator/episodes/upload", post(episodes_upload_handler))
        .route("/coordinator/tactical-weights", get(tactical_weights_handler))
        .route("/coordinator/tactical-stats", get(tactical_stats_handler))
        .layer(cors)
        .with_state(state)
}

// -----------------------------------------------------------------------------
// Основной трафик
// -----------------------------------------------------------------------------

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadAck>, ApiError> {
    let outcome = state.coord.upload(req).await?;
    if outcome.aggregated {
        // выгрузка backlog'а не задерживает ответ клиенту
        coordinator::spawn_flush(state.coord.clone());
    }
    Ok(Json(outcome.ack))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalQuery {
    mob_type: Option<String>,
}

async fn global_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GlobalQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = state.coord.get_global(query.mob_type.as_deref()).await?;
    Ok(Json(value))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coord.status().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    server_id: Option<String>,
    #[serde(default)]
    active_mobs: Vec<String>,
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ack = state.coord.heartbeat(req.server_id, req.active_mobs).await?;
    Ok(Json(serde_json::to_value(ack).unwrap_or_default()))
}

async fn flush_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coord.flush_backlog().await)
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.coord.backfill_current_global().await?))
}

// -----------------------------------------------------------------------------
// Админ-поверхность
// -----------------------------------------------------------------------------

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), CoordError> {
    let token = state
        .admin_token
        .as_deref()
        .ok_or(CoordError::AdminNotConfigured)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if presented == token {
        Ok(())
    } else {
        Err(CoordError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    start_round: Option<u64>,
}

async fn admin_reset_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_admin(&state, &headers)?;
    let start_round = req
        .start_round
        .ok_or_else(|| CoordError::BadRequest("startRound is required".into()))?;
    Ok(Json(state.coord.admin_reset_round(start_round).await?))
}

async fn admin_backfill_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_admin(&state, &headers)?;
    Ok(Json(state.coord.backfill_current_global().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkMissingRequest {
    round: Option<u64>,
    reason: Option<String>,
    notes: Option<String>,
}

async fn admin_mark_missing_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MarkMissingRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_admin(&state, &headers)?;
    let round = req
        .round
        .ok_or_else(|| CoordError::BadRequest("round is required".into()))?;
    let reason = req.reason.unwrap_or_else(|| "unspecified".to_string());
    let notes = req.notes.unwrap_or_default();
    Ok(Json(
        state.coord.admin_mark_missing(round, &reason, &notes).await?,
    ))
}

// -----------------------------------------------------------------------------
// Вспомогательные каналы
// -----------------------------------------------------------------------------

async fn tiers_upload_handler(
    State(state): State<Arc<AppState>>,
    Json(incoming): Json<TierState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.coord.tier_upload(incoming).await?))
}

async fn tiers_download_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coord.tier_download().await)
}

async fn episodes_upload_handler(
    State(state): State<Arc<AppState>>,
    Json(episode): Json<EpisodeRecord>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.coord.episode_upload(episode).await?))
}

async fn tactical_weights_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coord.tactical_weights().await)
}

async fn tactical_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coord.tactical_stats().await)
}
