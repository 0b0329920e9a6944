use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cast_signal::{ChannelHub, SessionRegistry};
use chrono::Utc;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::livekit::{random_id, LiveKitError, RoomService, RANDOM_ID_LEN};
use crate::ws;

pub struct AppState {
    pub hub: ChannelHub,
    pub registry: SessionRegistry,
    pub rooms: Option<Arc<dyn RoomService>>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    fn rooms(&self) -> Result<&Arc<dyn RoomService>, ApiError> {
        self.rooms
            .as_ref()
            .ok_or(ApiError::Unavailable("livekit is not configured"))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/video", get(ws::ws_handler))
        .route("/api", get(hello))
        .route("/api/startStreamRoom", post(start_stream_room))
        .route("/api/startRTMPStream", post(start_rtmp_stream))
        .route("/api/stopRTMPStream", post(stop_rtmp_stream))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/debug/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(&'static str),
    Upstream(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.to_string())
            }
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream", msg),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<LiveKitError> for ApiError {
    fn from(err: LiveKitError) -> Self {
        counter!("cast_gateway_livekit_errors_total", 1);
        warn!(error = %err, "livekit call failed");
        ApiError::Upstream(err.to_string())
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} should not be empty")));
    }
    Ok(trimmed)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamRoomRequest {
    #[serde(default)]
    participant_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRoomResponse {
    pub room_name: String,
    pub token: String,
    pub identity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRtmpStreamRequest {
    #[serde(default, rename = "rtmpURL")]
    rtmp_url: String,
    #[serde(default)]
    stream_key: String,
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    identity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRtmpStreamRequest {
    #[serde(default)]
    egress_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressResponse {
    pub egress_id: String,
}

#[derive(Debug, Serialize)]
struct SessionEntry {
    client_id: String,
    generation: u64,
    phase: &'static str,
    pending_candidates: usize,
    time_in_phase_ms: u128,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    connected_channels: usize,
    active_sessions: usize,
    sessions: Vec<SessionEntry>,
}

async fn hello() -> impl IntoResponse {
    Json(json!({
        "text": "Hello from the cast gateway!",
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

async fn start_stream_room(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartStreamRoomRequest>,
) -> ApiResult<StartStreamRoomResponse> {
    let rooms = state.rooms()?;
    let participant = required("participantName", &request.participant_name)?;

    let room = rooms.create_room(&random_id(RANDOM_ID_LEN)).await?;
    let identity = random_id(RANDOM_ID_LEN);
    let token = rooms.participant_token(&room.name, &identity, Some(participant))?;

    counter!("cast_gateway_rooms_started_total", 1);
    info!(room = %room.name, identity = %identity, "stream room ready");
    Ok(Json(StartStreamRoomResponse {
        room_name: room.name,
        token,
        identity,
    }))
}

async fn start_rtmp_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRtmpStreamRequest>,
) -> ApiResult<EgressResponse> {
    let rooms = state.rooms()?;
    let rtmp_url = required("rtmpURL", &request.rtmp_url)?;
    let stream_key = required("streamKey", &request.stream_key)?;
    let room_id = required("roomId", &request.room_id)?;
    let identity = required("identity", &request.identity)?;

    let destination = format!("{}/{}", rtmp_url.trim_end_matches('/'), stream_key);
    let egress = rooms.start_rtmp_egress(room_id, &destination).await?;

    counter!("cast_gateway_egress_started_total", 1);
    info!(room = room_id, identity, egress_id = %egress.egress_id, "rtmp stream started");
    Ok(Json(EgressResponse {
        egress_id: egress.egress_id,
    }))
}

async fn stop_rtmp_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRtmpStreamRequest>,
) -> ApiResult<EgressResponse> {
    let rooms = state.rooms()?;
    let egress_id = required("egressId", &request.egress_id)?;
    let egress = rooms.stop_egress(egress_id).await?;
    counter!("cast_gateway_egress_stopped_total", 1);
    Ok(Json(EgressResponse {
        egress_id: egress.egress_id,
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<SessionEntry> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|snap| SessionEntry {
            client_id: snap.client_id.to_string(),
            generation: snap.generation,
            phase: snap.phase.as_str(),
            pending_candidates: snap.pending_candidates,
            time_in_phase_ms: snap.time_in_phase.as_millis(),
        })
        .collect();
    Json(SessionsResponse {
        connected_channels: state.hub.connected(),
        active_sessions: sessions.len(),
        sessions,
    })
}
