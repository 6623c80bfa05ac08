//! HTTP surface of the hub: the SSE event stream and subscription control.
//!
//! ```text
//! GET    /events                          SSE stream (X-User-Id optional,
//!                                         Last-Event-ID or ?last_event_id=
//!                                         to replay missed events)
//! POST   /connections/{id}/subscriptions  add a SubscriptionTarget
//! DELETE /connections/{id}/subscriptions  remove a SubscriptionTarget
//! GET    /connections/{id}                ConnectionInfo
//! GET    /stats                           HubStats
//! GET    /health                          "OK"
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{ConnectionId, ConnectionInfo, HubFrame, HubHandle, HubStats, SubscriptionTarget};
use crate::config::HubSettings;
use crate::error::{SyncError, SyncResult};

const USER_ID_HEADER: &str = "x-user-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub struct HubServer {
    bind_addr: String,
    hub: HubHandle,
}

impl HubServer {
    pub fn new(settings: &HubSettings, hub: HubHandle) -> Self {
        Self::with_address(settings.bind_address(), hub)
    }

    pub fn with_address(bind_addr: impl Into<String>, hub: HubHandle) -> Self {
        HubServer {
            bind_addr: bind_addr.into(),
            hub,
        }
    }

    pub fn router(hub: HubHandle) -> Router {
        Router::new()
            .route("/events", get(events_handler))
            .route(
                "/connections/{id}/subscriptions",
                post(subscribe_handler).delete(unsubscribe_handler),
            )
            .route("/connections/{id}", get(connection_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .with_state(hub)
    }

    /// Binds the listener and serves until `shutdown` fires.
    ///
    /// Returns the bound address (useful with port 0) and the server task.
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> SyncResult<(SocketAddr, JoinHandle<()>)> {
        let app = Self::router(self.hub);

        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            SyncError::TransportError(format!("Failed to bind to {}: {}", self.bind_addr, e))
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| SyncError::TransportError(e.to_string()))?;

        info!(addr = %addr, "Hub server started");

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("Hub server shutting down");
                })
                .await;
            if let Err(e) = result {
                error!(?e, "Hub server failed");
            }
        });

        Ok((addr, task))
    }
}

// =============================================================================
// Event Stream
// =============================================================================

/// Disconnects the client when the response stream is dropped.
struct ConnectionGuard {
    id: ConnectionId,
    hub: HubHandle,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect_nowait(self.id);
    }
}

fn to_sse(frame: HubFrame) -> Event {
    match frame {
        HubFrame::Event { id, name, data } => Event::default()
            .id(id.to_string())
            .event(name)
            .data(data.to_string()),
        HubFrame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    last_event_id: Option<String>,
}

/// The header wins over the query parameter. Ids that are not numbers are
/// ignored, so the client simply starts without a replay.
fn last_event_id(headers: &HeaderMap, query: &EventsQuery) -> Option<u64> {
    let raw = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(query.last_event_id.as_deref())?;
    match raw.trim().parse() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!(last_event_id = raw, "Ignoring malformed last event id");
            None
        }
    }
}

async fn events_handler(
    State(hub): State<HubHandle>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SyncError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let last_event_id = last_event_id(&headers, &query);

    let grant = hub.connect(user_id, last_event_id).await?;
    let guard = ConnectionGuard {
        id: grant.id,
        hub: hub.clone(),
    };

    let stream = ReceiverStream::new(grant.frames)
        .map(move |frame| {
            let _guard = &guard;
            Ok(to_sse(frame))
        })
        .take_until(grant.cancel.cancelled_owned());

    Ok(Sse::new(stream))
}

// =============================================================================
// Control Handlers
// =============================================================================

async fn subscribe_handler(
    State(hub): State<HubHandle>,
    Path(id): Path<ConnectionId>,
    Json(target): Json<SubscriptionTarget>,
) -> Result<Json<serde_json::Value>, SyncError> {
    hub.subscribe(id, target).await?;
    Ok(Json(json!({ "status": "subscribed" })))
}

async fn unsubscribe_handler(
    State(hub): State<HubHandle>,
    Path(id): Path<ConnectionId>,
    Json(target): Json<SubscriptionTarget>,
) -> Result<Json<serde_json::Value>, SyncError> {
    hub.unsubscribe(id, target).await?;
    Ok(Json(json!({ "status": "unsubscribed" })))
}

async fn connection_handler(
    State(hub): State<HubHandle>,
    Path(id): Path<ConnectionId>,
) -> Result<Json<ConnectionInfo>, SyncError> {
    Ok(Json(hub.connection_info(id).await?))
}

async fn stats_handler(State(hub): State<HubHandle>) -> Result<Json<HubStats>, SyncError> {
    Ok(Json(hub.stats().await?))
}

async fn health_handler() -> &'static str {
    "OK"
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidSubscription(_) => StatusCode::BAD_REQUEST,
            SyncError::ChannelError(_) | SyncError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
