//! `ChapiServer`: the axum HTTP surface.
//!
//! Every path without its own route goes through the admission gate, which
//! either handles a presence notification or holds the request open.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chapi_core::{ChapiError, ChapiResult, ClientId, PresenceKind};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::channel::local::Subscription;
use crate::channel::LocalChannelService;
use crate::config::ServerConfig;
use crate::gate::{Admission, AdmissionGate, InboundRequest};
use crate::lifecycle::{BroadcastReport, ConnectionInfo, ConnectionRegistry, LifecycleController};
use crate::suspend::{ResumeCause, SuspendEngine};

/// Response header carrying the channel token of a newly held request.
pub const TOKEN_HEADER: &str = "chapi_token";

/// Client identity. Set on every held response; a reconnecting client sends
/// it back to keep that identity.
pub const CLIENT_ID_HEADER: &str = "x-chapi-client-id";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub controller: Arc<LifecycleController>,
    pub channel: Arc<LocalChannelService>,
    pub start_time: Instant,
}

pub struct ChapiServer {
    config: ServerConfig,
    state: AppState,
}

impl ChapiServer {
    pub fn new(config: ServerConfig) -> ChapiResult<Self> {
        let channel = Arc::new(LocalChannelService::from_config(&config)?);
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let controller = Arc::new(LifecycleController::new(registry, channel.clone()));
        let engine = Arc::new(SuspendEngine::from_config(&config));
        let gate = Arc::new(AdmissionGate::new(controller.clone(), engine));

        Ok(Self {
            config,
            state: AppState {
                gate,
                controller,
                channel,
                start_time: Instant::now(),
            },
        })
    }

    #[cfg(test)]
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.state.controller
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/_ah/channel/open", get(open_channel))
            .route("/_chapi/broadcast", post(broadcast_all))
            .route("/_chapi/broadcast/{client_id}", post(broadcast_one))
            .route("/_chapi/resume/{client_id}", post(resume_one))
            .route("/_chapi/connections", get(list_connections))
            .fallback(admit_request)
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` completes, then resume every held connection
    /// and close every channel.
    pub async fn run<F>(self, shutdown: F) -> ChapiResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %listener.local_addr()?,
            suspend_paths = ?self.config.suspend_paths,
            charset = %self.config.charset,
            "chapi-server ready"
        );

        let app = self.router();
        let controller = self.state.controller.clone();
        let channel = self.state.channel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                controller.shutdown().await;
                let closed = channel.close_all().await;
                info!(channels = closed, "channels closed");
            })
            .await?;

        Ok(())
    }
}

/// A [`ChapiError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ChapiError);

impl From<ChapiError> for ApiError {
    fn from(e: ChapiError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_fatal() => {
                error!(error = %e, "fatal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ChapiError::ConnectionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChapiError::Token(_) => StatusCode::FORBIDDEN,
            ChapiError::Encoding { .. } | ChapiError::Codec(_) => StatusCode::BAD_REQUEST,
            ChapiError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            e => {
                warn!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    uptime_secs: u64,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.controller.registry().count().await,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Fallback: presence notification or application request.
async fn admit_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ClientId::new);

    let req = InboundRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        client_id,
        body,
    };

    match state.gate.admit(req).await? {
        Admission::Resume {
            presence: PresenceKind::None,
        } => Ok(StatusCode::NO_CONTENT.into_response()),
        Admission::Resume { .. } => Ok(StatusCode::OK.into_response()),
        Admission::Suspend(held) => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(TOKEN_HEADER, held.token.as_str())
                .header(CLIENT_ID_HEADER, held.client_id.as_str())
                .header(
                    CONTENT_TYPE,
                    format!("text/plain; charset={}", held.charset.label()),
                )
                .body(Body::from_stream(held.body))
                .map_err(|e| ChapiError::Other(format!("response build failed: {e}")))?;
            Ok(response)
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenParams {
    token: String,
}

/// GET /_ah/channel/open?token=…
///
/// Streams the frames delivered to the token's client. Opening posts a
/// connected presence notification; the stream ending posts a disconnected
/// one.
async fn open_channel(
    State(state): State<AppState>,
    Query(params): Query<OpenParams>,
) -> Result<Response, ApiError> {
    let Subscription { client_id, id, rx } = state.channel.open(&params.token).await?;
    let guard = SubscriptionGuard {
        state: state.clone(),
        client_id: client_id.clone(),
        id,
    };

    if let Some(req) = InboundRequest::presence(PresenceKind::Connected, &client_id) {
        state.gate.admit(req).await?;
    }

    let frames = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame: Option<String> = rx.recv().await;
        frame.map(|frame| (Ok::<_, Infallible>(Bytes::from(frame)), (rx, guard)))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(frames))
        .map_err(|e| ChapiError::Other(format!("response build failed: {e}")).into())
}

/// Closes a channel subscription when its stream goes away.
struct SubscriptionGuard {
    state: AppState,
    client_id: ClientId,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        let id = self.id;
        runtime.spawn(async move {
            // A newer subscription for the client keeps it connected.
            if !state.channel.close(&client_id, id).await {
                return;
            }
            let Some(req) = InboundRequest::presence(PresenceKind::Disconnected, &client_id) else {
                return;
            };
            if let Err(e) = state.gate.admit(req).await {
                warn!(client_id = %client_id.short(), error = %e, "disconnected presence failed");
            }
        });
    }
}

/// POST /_chapi/broadcast
async fn broadcast_all(State(state): State<AppState>, text: String) -> Json<BroadcastReport> {
    Json(state.controller.broadcast(&text).await)
}

/// POST /_chapi/broadcast/{client_id}
async fn broadcast_one(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    text: String,
) -> Result<Json<BroadcastReport>, Response> {
    let client_id = ClientId::new(client_id);
    match state.controller.write_to(&client_id, &text).await {
        Ok(()) => Ok(Json(BroadcastReport {
            delivered: 1,
            failed: 0,
        })),
        Err(ChapiError::ConnectionNotFound(_)) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(ApiError::from(e).into_response()),
    }
}

/// POST /_chapi/resume/{client_id}
async fn resume_one(State(state): State<AppState>, Path(client_id): Path<String>) -> StatusCode {
    let client_id = ClientId::new(client_id);
    if state
        .controller
        .resume(&client_id, None, ResumeCause::Administrative)
        .await
    {
        StatusCode::NO_CONTENT
    } else {
        debug!(client_id = %client_id.short(), "resume requested for unknown client");
        StatusCode::NOT_FOUND
    }
}

/// GET /_chapi/connections
async fn list_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.controller.connections().await)
}
