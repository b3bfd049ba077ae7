//! HTTP + WebSocket server (single port).

use crate::config::{resolve_content_base_url, Config};
use crate::content::{ContentService, HttpContentClient, SessionCreateRequest};
use crate::game::{
    self, create_session, CreateSessionError, Frame, Role, SessionHandle, SessionRegistry,
    SessionSettings, TransportError,
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub content: Arc<dyn ContentService>,
    pub settings: SessionSettings,
}

impl AppState {
    pub fn new(config: Config, content: Arc<dyn ContentService>) -> Self {
        let settings = SessionSettings::from_config(&config);
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            content,
            settings,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/sessions", post(create_session_http))
        .route("/api/sessions/:code", get(session_status_http))
        .route("/ws/:code", get(ws_handler))
        .with_state(state)
}

/// Bind from config, talk to the configured content service, run until SIGINT/SIGTERM.
pub async fn run_server(config: Config) -> Result<()> {
    let base_url = resolve_content_base_url(&config);
    let content = HttpContentClient::new(&base_url, Duration::from_secs(config.content.timeout_secs))
        .context("building content service client")?;
    log::info!("content service at {}", base_url);

    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("server listening on {}", bind_addr);

    let state = AppState::new(config, Arc::new(content));
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` completes, then shut every
/// session down and wait for connections to drain.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let sessions = &state.config.sessions;
    let reaper = registry.spawn_reaper(sessions.reap_interval(), sessions.idle_ttl(), sessions.completed_ttl());

    let app = router(state);
    let drain = registry.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, closing sessions");
            drain.shutdown_all().await;
        })
        .await
        .context("server exited");
    reaper.abort();
    log::info!("server stopped");
    result
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "sessions": state.registry.len().await,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    game: i64,
    host_name: String,
    #[serde(default)]
    max_teams: Option<u32>,
}

/// POST /api/sessions
async fn create_session_http(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let host_name = body.host_name.trim().to_string();
    if host_name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "host_name is required");
    }
    let request = SessionCreateRequest {
        game: body.game,
        host_name,
        max_teams: body.max_teams.unwrap_or(state.config.sessions.max_teams),
    };
    let created = create_session(
        &state.registry,
        state.content.clone(),
        &state.settings,
        &request,
        state.config.sessions.max_code_attempts,
    )
    .await;
    match created {
        Ok(created) => Json(json!({
            "session_code": created.handle.code(),
            "session_id": created.session_id,
            "game_name": created.game_name,
            "questions": created.questions,
            "status": game::SessionStatus::Waiting,
        }))
        .into_response(),
        Err(e @ CreateSessionError::CodeCollision { .. }) => {
            log::error!("session creation failed: {}", e);
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e @ CreateSessionError::Content(_)) => {
            log::error!("session creation failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/sessions/:code
async fn session_status_http(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    let Some(handle) = state.registry.get(&code).await else {
        return error_response(StatusCode::NOT_FOUND, format!("session {} not found", code));
    };
    let snap = handle.snapshot().await;
    Json(json!({
        "code": snap.code,
        "game_name": snap.game_name,
        "status": snap.status,
        "current_question": snap.current_question,
        "total_questions": snap.total_questions,
        "teams": snap.teams,
        "connections": snap.connections,
        "has_host": snap.has_host,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "type")]
    role: Option<String>,
    name: Option<String>,
}

/// GET /ws/:code?type=host|team&name=... upgrades to WebSocket.
async fn ws_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let role: Role = match query.role.as_deref().unwrap_or("").parse() {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let name = query.name.as_deref().map(str::trim).unwrap_or("");
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }
    let Some(session) = state.registry.get(&code).await else {
        return error_response(StatusCode::NOT_FOUND, format!("session {} not found", code));
    };
    let name = name.to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, session, name, role))
}

/// Adapt the socket to the connection pumps and run them until either side ends.
async fn handle_socket(socket: WebSocket, session: SessionHandle, name: String, role: Role) {
    let (connection, outbound) = session.connect(name, role);
    let (sink, stream) = socket.split();

    let reader = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::Io(e.to_string()))),
        })
    });
    let writer = sink
        .with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::Text(frame.to_string()))))
        .sink_map_err(|e| TransportError::Io(e.to_string()));

    game::serve(connection, outbound, session, reader, writer).await;
}
