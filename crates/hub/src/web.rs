use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use anyhow::Context;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::cache::{AppCache, Namespace};
use crate::config;
use crate::db::{ActuatorState, Db};
use crate::dispatch::Dispatcher;
use crate::error::{ApiError, ApiResult};
use crate::notify::Notifier;
use crate::state::SharedState;

#[derive(Clone)]
pub struct WebState {
    pub shared: SharedState,
    pub db: Db,
    pub cache: Arc<AppCache>,
    pub dispatcher: Dispatcher,
    pub notifier: Notifier,
    /// Seed file re-read by `POST /api/config/reload`.
    pub config_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/events", get(api_events))
        .route("/api/cache", delete(api_cache_clear_all))
        .route("/api/cache/stats", get(api_cache_stats))
        .route("/api/cache/{namespace}", delete(api_cache_clear))
        .route("/api/config/reload", post(api_config_reload))
        .route("/api/users/{id}/devices", get(api_user_devices))
        .route("/api/actuators/{id}/control", post(api_control))
        .route("/api/devices/{id}/emergency-stop", post(api_emergency_stop))
        .route("/api/devices/{id}/resync", post(api_resync))
        .with_state(state)
}

async fn api_status(State(state): State<WebState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

/// Push events as Server-Sent Events, named after the event.
async fn api_events(State(state): State<WebState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.notifier.subscribe()).filter_map(|msg| match msg {
        Ok(ev) => match Event::default().event(ev.name()).json_data(&ev) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
                warn!(event = ev.name(), "failed to encode push event: {e}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!(missed, "push subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// -- Cache ------------------------------------------------------------------

async fn api_cache_stats(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

async fn api_cache_clear_all(State(state): State<WebState>) -> StatusCode {
    state.cache.clear_all();
    StatusCode::NO_CONTENT
}

async fn api_cache_clear(State(state): State<WebState>, Path(namespace): Path<String>) -> ApiResult<StatusCode> {
    let ns = Namespace::parse(&namespace)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown cache namespace: {namespace}")))?;
    state.cache.clear(ns);
    Ok(StatusCode::NO_CONTENT)
}

async fn api_config_reload(State(state): State<WebState>) -> ApiResult<StatusCode> {
    let path = state
        .config_path
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("no seed file configured (CONFIG_PATH)".to_string()))?;
    config::reload(path, &state.db, &state.cache)
        .await
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Lookups ----------------------------------------------------------------

async fn api_user_devices(State(state): State<WebState>, Path(user_id): Path<i64>) -> ApiResult<impl IntoResponse> {
    if let Some(devices) = state.cache.user_devices(user_id) {
        return Ok(Json(devices));
    }

    let user = match state.cache.user(user_id) {
        Some(u) => u,
        None => {
            let u = state
                .db
                .get_user(user_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))?;
            state.cache.put_user(&u);
            u
        }
    };

    let devices = state.db.devices_for_user(user.id).await?;
    state.cache.put_user_devices(user.id, devices.clone());
    Ok(Json(devices))
}

// -- Commands ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ControlRequest {
    accion: String,
    usuario_id: Option<i64>,
}

async fn api_control(
    State(state): State<WebState>,
    Path(actuator_id): Path<i64>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<impl IntoResponse> {
    let target = match req.accion.as_str() {
        "encender" => ActuatorState::On,
        "apagar" => ActuatorState::Off,
        other => {
            return Err(ApiError::BadRequest(format!(
                "accion must be \"encender\" or \"apagar\", got {other:?}"
            )))
        }
    };
    let done = state
        .dispatcher
        .manual_control(actuator_id, target, req.usuario_id)
        .await?;
    Ok(Json(done))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    usuario_id: Option<i64>,
}

async fn api_emergency_stop(
    State(state): State<WebState>,
    Path(device_id): Path<i64>,
    Query(req): Query<StopRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcomes = state.dispatcher.emergency_stop(device_id, req.usuario_id).await?;
    Ok(Json(outcomes))
}

async fn api_resync(State(state): State<WebState>, Path(device_id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let delivered = state.dispatcher.publish_device_state(device_id).await?;
    Ok(Json(serde_json::json!({ "device_id": device_id, "delivered": delivered })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: WebState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
