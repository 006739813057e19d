use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::mqtt::Transport;
use crate::session::Notification;
use crate::session::Session;
use crate::sync::lock;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    client_id: String,
    device_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Body of POST /v1/light/brightness; out-of-range levels are clamped
#[derive(Debug, Deserialize)]
struct BrightnessRequest {
    level: i64,
}

/// A notification waiting for the user, addressable by id
#[derive(Debug, Clone, Serialize)]
pub struct PendingNotification {
    pub id: u64,
    #[serde(flatten)]
    pub notification: Notification,
}

/// Most notifications kept; older ones are dropped first
pub const MAX_PENDING_NOTIFICATIONS: usize = 32;

/// Notifications raised by the session that have not been retried or dismissed yet
#[derive(Clone, Default)]
pub struct NotificationInbox {
    inner: Arc<Mutex<InboxState>>,
}

#[derive(Default)]
struct InboxState {
    next_id: u64,
    pending: BTreeMap<u64, Notification>,
}

impl NotificationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: Notification) -> u64 {
        let mut state = lock(&self.inner);
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id, notification);

        while state.pending.len() > MAX_PENDING_NOTIFICATIONS {
            if let Some((dropped, _)) = state.pending.pop_first() {
                tracing::debug!("Dropping oldest notification {}", dropped);
            }
        }
        id
    }

    /// Pending notifications, oldest first
    pub fn pending(&self) -> Vec<PendingNotification> {
        lock(&self.inner)
            .pending
            .iter()
            .map(|(id, notification)| PendingNotification {
                id: *id,
                notification: notification.clone(),
            })
            .collect()
    }

    /// Remove and return a notification
    pub fn take(&self, id: u64) -> Option<Notification> {
        lock(&self.inner).pending.remove(&id)
    }

    /// Move everything arriving on `notifications` into the inbox
    pub fn collect(
        &self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) -> JoinHandle<()> {
        let inbox = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let id = inbox.push(notification);
                tracing::debug!("Queued notification {}", id);
            }
        })
    }
}

/// Shared application state
pub struct AppState<T: Transport> {
    version: &'static str,
    client_id: String,
    session: Session<T>,
    inbox: NotificationInbox,
}

impl<T: Transport> AppState<T> {
    pub fn new(session: Session<T>, inbox: NotificationInbox, client_id: String) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            client_id,
            session,
            inbox,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info<T: Transport>(State(state): State<Arc<AppState<T>>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            client_id: state.client_id.clone(),
            device_id: state.session.device_id().to_string(),
        }),
    )
}

/// Handler for GET /v1/light
#[tracing::instrument(skip(state))]
async fn light<T: Transport>(State(state): State<Arc<AppState<T>>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.session.snapshot()))
}

/// Handler for POST /v1/light/power
#[tracing::instrument(skip(state))]
async fn toggle_power<T: Transport>(State(state): State<Arc<AppState<T>>>) -> impl IntoResponse {
    // The publish may wait for the connection; failures arrive as notifications
    tokio::spawn(state.session.toggle_power());
    (StatusCode::ACCEPTED, Json(state.session.snapshot()))
}

/// Handler for POST /v1/light/brightness
#[tracing::instrument(skip(state))]
async fn set_brightness<T: Transport>(
    State(state): State<Arc<AppState<T>>>,
    Json(request): Json<BrightnessRequest>,
) -> impl IntoResponse {
    state.session.set_brightness(request.level);
    (StatusCode::ACCEPTED, Json(state.session.snapshot()))
}

/// Handler for POST /v1/connect
#[tracing::instrument(skip(state))]
async fn connect<T: Transport>(State(state): State<Arc<AppState<T>>>) -> impl IntoResponse {
    state.session.reconnect();
    (StatusCode::ACCEPTED, Json(state.session.snapshot()))
}

/// Handler for GET /v1/notifications
#[tracing::instrument(skip(state))]
async fn notifications<T: Transport>(State(state): State<Arc<AppState<T>>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.inbox.pending()))
}

/// Handler for POST /v1/notifications/:id/retry
#[tracing::instrument(skip(state))]
async fn retry<T: Transport>(
    State(state): State<Arc<AppState<T>>>,
    Path(id): Path<u64>,
) -> Response {
    let Some(notification) = state.inbox.take(id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No pending notification {}", id),
            }),
        )
            .into_response();
    };

    let session = state.session.clone();
    let action = notification.action;
    tokio::spawn(async move { session.retry(action).await });

    (
        StatusCode::ACCEPTED,
        Json(PendingNotification { id, notification }),
    )
        .into_response()
}

/// Handler for DELETE /v1/notifications/:id
#[tracing::instrument(skip(state))]
async fn dismiss<T: Transport>(
    State(state): State<Arc<AppState<T>>>,
    Path(id): Path<u64>,
) -> Response {
    match state.inbox.take(id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No pending notification {}", id),
            }),
        )
            .into_response(),
    }
}

/// Create the API router with all endpoints
fn create_router<T: Transport>(state: Arc<AppState<T>>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info::<T>))
        .route("/v1/light", get(light::<T>))
        .route("/v1/light/power", post(toggle_power::<T>))
        .route("/v1/light/brightness", post(set_brightness::<T>))
        .route("/v1/connect", post(connect::<T>))
        .route("/v1/notifications", get(notifications::<T>))
        .route("/v1/notifications/:id", delete(dismiss::<T>))
        .route("/v1/notifications/:id/retry", post(retry::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves the API until `shutdown_rx` fires.
pub async fn serve<T: Transport>(
    listen: &str,
    port: u16,
    state: AppState<T>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), ApiError> {
    let app = create_router(Arc::new(state));

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
