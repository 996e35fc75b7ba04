//! HTTP and WebSocket handlers for the hubbub server.
//!
//! The streaming endpoint admits the client address, upgrades, and hands the
//! socket to the connection pumps. The message routes mutate the store and
//! publish the matching event through the hub.

use crate::auth::{AdminSessions, SESSION_COOKIE, SESSION_LIFETIME};
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::policy::NicknamePolicy;
use crate::storage::{MemoryStore, MessageStore};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequest, Path, Request, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use hubbub_core::{pump, AdmissionPermit, Connection, ExitReason, Hub, IpAdmission};
use hubbub_protocol::{ChatMessage, Event, MessageId, NewMessage};
use hubbub_transport::{websocket, TransportError};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// Broadcast hub.
    pub hub: Hub,
    /// Per-address connection ceiling.
    pub admission: Arc<IpAdmission>,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
    /// Admin sessions.
    pub sessions: AdminSessions,
    /// Nickname policy.
    pub policy: NicknamePolicy,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by an in-memory store.
    #[must_use]
    pub fn new(config: Config, hub: Hub) -> Self {
        Self::with_store(config, hub, Arc::new(MemoryStore::new()))
    }

    /// Create app state with a custom store.
    #[must_use]
    pub fn with_store(config: Config, hub: Hub, store: Arc<dyn MessageStore>) -> Self {
        Self {
            hub,
            admission: Arc::new(IpAdmission::with_limit(config.limits.max_connections_per_ip)),
            store,
            sessions: AdminSessions::new(config.admin.password_sha256.clone()),
            policy: NicknamePolicy::new(config.banned_nicknames.clone()),
            config,
        }
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let chat = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/messages", get(list_messages).post(post_message))
        .route("/message/:id", get(get_message))
        .route("/messages/:id", delete(delete_message));

    let app = Router::new()
        .route("/admin/login", post(admin_login))
        .route("/health", get(health_handler));

    let app = match state.config.base() {
        "" => app.merge(chat),
        base => app.nest(base, chat),
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops abnormally.
pub async fn run_server(config: Config, hub: Hub) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!(error = %e, "Failed to start metrics server");
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("hubbub listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}{}",
        addr,
        config.base(),
        config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config, hub))).await
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connection_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let address = client_ip(peer, &headers);
    let permit = state.admission.permit(address).map_err(|e| {
        metrics::record_admission_rejected();
        ApiError::from(e)
    })?;

    // A failed upgrade drops the callback and the permit with it.
    let response = ws
        .max_message_size(state.config.transport.max_message_size)
        .on_failed_upgrade(|e: axum::Error| {
            let err = TransportError::UpgradeFailed(e.to_string());
            warn!(error = %err, "WebSocket connection not established");
            metrics::record_error("upgrade");
        })
        .on_upgrade(move |socket| handle_websocket(socket, state, permit));

    Ok(response)
}

/// Run one upgraded connection to completion.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, permit: AdmissionPermit) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = Connection::new(
        permit.address(),
        state.hub.outbound_capacity(),
        state.config.rate_limit_config(),
    );
    let id = connection.id();
    debug!(connection = %id, address = %permit.address(), "WebSocket connected");

    let (sink, stream) = websocket::split(socket);
    let reason = pump::serve(
        connection,
        state.hub.clone(),
        sink,
        stream,
        state.config.pump_config(),
    )
    .await;

    match &reason {
        ExitReason::RateLimited => metrics::record_rate_limited(),
        ExitReason::Transport(_) => metrics::record_error("transport"),
        _ => {}
    }

    debug!(connection = %id, address = %permit.address(), reason = ?reason, "WebSocket disconnected");
    drop(permit);
}

/// Resolve the client address.
///
/// Forwarding headers are only trusted from a loopback peer (a local reverse
/// proxy).
#[must_use]
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> String {
    if peer.ip().is_loopback() {
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(real) = header_str("x-real-ip") {
            return real.to_string();
        }
        if let Some(first) = header_str("x-forwarded-for")
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first.to_string();
        }
    }

    peer.ip().to_string()
}

/// Create a message and publish it.
async fn post_message(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let submission = read_submission(request)
        .await?
        .normalize()
        .ok_or_else(|| ApiError::BadRequest("content is required".to_string()))?;

    if state.policy.is_banned(&submission.nickname) {
        debug!(nickname = %submission.nickname, "Rejected banned nickname");
        return Err(ApiError::ProhibitedNickname);
    }

    let stored = state.store.insert(submission);
    debug!(id = stored.id, nickname = %stored.nickname, "Message stored");

    publish(&state, Event::new_message(stored.clone())).await;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Accept either a JSON body or an urlencoded form.
async fn read_submission(request: Request) -> Result<NewMessage, ApiError> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    if is_json {
        let Json(message) = Json::<NewMessage>::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(message)
    } else {
        let Form(message) = Form::<NewMessage>::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(message)
    }
}

/// List all messages.
async fn list_messages(State(state): State<Arc<AppState>>) -> Json<Vec<ChatMessage>> {
    Json(state.store.list_all())
}

/// Fetch one message.
async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> Result<Json<ChatMessage>, ApiError> {
    state.store.get(id).map(Json).ok_or(ApiError::NotFound(id))
}

/// Delete a message (admin only) and publish the removal.
async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = session_cookie(&headers).ok_or(ApiError::Unauthorized)?;
    state.sessions.is_admin_session(token)?;

    state.store.delete(id)?;
    debug!(id, "Message deleted");

    publish(&state, Event::delete_message(id)).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

/// Exchange the admin password for a session cookie.
async fn admin_login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, ApiError> {
    let token = state.sessions.login(&form.password)?;

    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE,
        token,
        SESSION_LIFETIME.as_secs()
    );
    let cookie = HeaderValue::from_str(&cookie).map_err(|e| ApiError::Internal(e.to_string()))?;

    info!("Admin session issued");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "status": "ok" })),
    ))
}

/// Value of the admin session cookie, if present.
fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

/// Hand an event to the hub. The store has already changed, so a closed hub
/// is logged rather than surfaced to the caller.
async fn publish(state: &AppState, event: Event) {
    let kind = event.kind().as_str();
    match state.hub.publish(&event).await {
        Ok(()) => metrics::record_event(kind),
        Err(e) => {
            warn!(kind, error = %e, "Event not published");
            metrics::record_error("publish");
        }
    }
}
