use std::{convert::Infallible, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::Path,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::{
    broker::serve_stream,
    control::{Confirmation, ControlError, ControlPlane},
    dispatch::ClusterCapacity,
    notify::ClusterEvent,
    state::ClusterState,
};

/// Encoded frames waiting to be written to one `/listen` client.
const SSE_OUTBOUND_CAPACITY: usize = 16;

const STATUS_OK: &str = "Ok";
const STATUS_IGNORED: &str = "Ignored";

#[derive(Clone)]
pub struct AppState {
    pub plane: ControlPlane,
    pub sse_keepalive: Duration,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new("upstream_error", StatusCode::BAD_GATEWAY, message)
    }
}

impl From<ControlError> for ApiError {
    fn from(value: ControlError) -> Self {
        let message = value.to_string();
        match value {
            ControlError::UnknownCluster { name } => {
                ApiError::invalid_request(message).with_detail("cluster", name)
            }
            ControlError::DispatchFailure { cluster, action } => ApiError::internal(message)
                .with_detail("cluster", cluster)
                .with_detail("action", action.as_str()),
            ControlError::MalformedConfirmation { .. } => ApiError::invalid_request(message),
            ControlError::Upstream { cluster, .. } => {
                ApiError::upstream(message).with_detail("cluster", cluster)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchResponse {
    pub status: String,
    pub context: String,
}

impl LaunchResponse {
    fn new(context: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            context: context.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedLaunchResponse {
    pub status: String,
    pub context: String,
    pub is_launched: bool,
    pub is_terminated: bool,
    /// Unix seconds of the last state change.
    pub date: i64,
}

impl ExtendedLaunchResponse {
    fn from_state(context: &str, state: ClusterState) -> Self {
        Self {
            status: state.status,
            context: context.to_string(),
            is_launched: state.is_launched,
            is_terminated: state.is_terminated,
            date: state.observed_at.timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstancesResponse {
    context: String,
    #[serde(flatten)]
    capacity: ClusterCapacity,
}

pub fn build_router(plane: ControlPlane, sse_keepalive: Duration) -> Router {
    let app_state = AppState {
        plane,
        sse_keepalive,
    };

    let servers = Router::new()
        .route("/:name/status", get(server_status))
        .route("/:name/launch", post(server_launch))
        .route("/:name/terminate", post(server_terminate))
        .route("/:name/instances", get(server_instances));

    Router::new()
        .nest("/servers", servers)
        .route("/clusters", get(list_clusters))
        .route("/listen", get(listen))
        .route("/launched", post(confirm_launched))
        .route("/terminated", post(confirm_terminated))
        .route("/event", post(publish_ping))
        .route("/health", get(health))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

/// Exact-match CORS for the configured frontends; permissive when none are
/// configured.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            header::AUTHORIZATION,
        ])
}

async fn server_status(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ExtendedLaunchResponse>, ApiError> {
    let cluster_state = state.plane.status(&name).await?;
    Ok(Json(ExtendedLaunchResponse::from_state(
        &name,
        cluster_state,
    )))
}

async fn server_launch(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LaunchResponse>, ApiError> {
    let phase = state.plane.launch(&name).await?;
    Ok(Json(LaunchResponse::new(name, phase.label())))
}

async fn server_terminate(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LaunchResponse>, ApiError> {
    let phase = state.plane.terminate(&name).await?;
    Ok(Json(LaunchResponse::new(name, phase.label())))
}

async fn server_instances(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstancesResponse>, ApiError> {
    let capacity = state.plane.capacity(&name).await?;
    Ok(Json(InstancesResponse {
        context: name,
        capacity,
    }))
}

async fn list_clusters(Extension(state): Extension<AppState>) -> Json<Vec<String>> {
    Json(state.plane.cluster_names())
}

async fn listen(
    Extension(state): Extension<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    let handle = state.plane.broker().subscribe().await;

    let (tx, rx) = mpsc::channel::<Event>(SSE_OUTBOUND_CAPACITY);
    tokio::spawn(async move {
        serve_stream(handle, tx, sse_json_event).await;
    });

    let out_stream = stream::unfold(rx, |mut rx| async move {
        let next = rx.recv().await?;
        Some((Ok(next), rx))
    });

    Sse::new(out_stream).keep_alive(
        KeepAlive::new()
            .interval(state.sse_keepalive)
            .text("keepalive"),
    )
}

fn sse_json_event(event: &ClusterEvent) -> Event {
    match event.to_json() {
        Ok(data) => Event::default().data(data),
        Err(err) => Event::default().event("error").data(err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationBody {
    resource_id: Option<String>,
    detail: Option<LifecycleDetail>,
}

/// Auto-scaling lifecycle notification payload.
#[derive(Debug, Deserialize)]
struct LifecycleDetail {
    #[serde(rename = "AutoScalingGroupName")]
    auto_scaling_group_name: Option<String>,
}

fn confirmation_resource_id(body: &[u8]) -> Result<String, ControlError> {
    let malformed = |reason: String| ControlError::MalformedConfirmation { reason };

    let parsed: ConfirmationBody =
        serde_json::from_slice(body).map_err(|e| malformed(format!("invalid json: {e}")))?;
    parsed
        .resource_id
        .or_else(|| parsed.detail.and_then(|d| d.auto_scaling_group_name))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing resource id".to_string()))
}

async fn confirm(state: AppState, confirmation: Confirmation, body: Bytes) -> Response {
    let outcome = match confirmation_resource_id(&body) {
        Ok(resource_id) => state.plane.confirm(&resource_id, confirmation).await,
        Err(err) => Err(err),
    };

    match outcome {
        Ok(event) => Json(LaunchResponse::new(event.context, STATUS_OK)).into_response(),
        Err(err) => {
            // Webhook senders do not act on failures; log and acknowledge.
            warn!(
                confirmation = confirmation.event_status(),
                error = %err,
                "confirmation ignored"
            );
            (
                StatusCode::ACCEPTED,
                Json(LaunchResponse::new("", STATUS_IGNORED)),
            )
                .into_response()
        }
    }
}

async fn confirm_launched(Extension(state): Extension<AppState>, body: Bytes) -> Response {
    confirm(state, Confirmation::Launched, body).await
}

async fn confirm_terminated(Extension(state): Extension<AppState>, body: Bytes) -> Response {
    confirm(state, Confirmation::Terminated, body).await
}

async fn publish_ping(Extension(state): Extension<AppState>) -> Json<LaunchResponse> {
    let event = state.plane.publish_ping().await;
    Json(LaunchResponse::new(event.context, STATUS_OK))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let subscribers = state.plane.broker().subscriber_count().await;
    Json(json!({
        "status": "ok",
        "mode": state.plane.dispatcher().mode().as_str(),
        "subscribers": subscribers,
    }))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
