//! The launcher: an HTTP server supervising the gateway process and hosting
//! the config + auth API the web and TUI editors consume.

pub mod auth_api;
pub mod auth_config;
pub mod logbuffer;
pub mod process;
pub mod sessions;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use logbuffer::LogBuffer;
use sessions::{ActiveDeviceSession, OAuthSessions};
use std::path::PathBuf;
use std::sync::Arc;

/// Default launcher port.
pub const DEFAULT_PORT: u16 = 18800;

/// Log lines retained for the status endpoint.
const LOG_CAPACITY: usize = 200;

/// Config PUT bodies are capped at 1 MiB.
const MAX_CONFIG_BODY: usize = 1 << 20;

pub struct LauncherState {
    pub config_path: PathBuf,
    pub credentials_path: PathBuf,
    pub logs: Arc<LogBuffer>,
    pub oauth_sessions: OAuthSessions,
    pub device_session: ActiveDeviceSession,
}

impl LauncherState {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            credentials_path: crate::auth::default_store_path(),
            logs: Arc::new(LogBuffer::new(LOG_CAPACITY)),
            oauth_sessions: OAuthSessions::default(),
            device_session: ActiveDeviceSession::default(),
        }
    }

    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = path;
        self
    }
}

/// Build the launcher router.
pub fn build_router(state: Arc<LauncherState>) -> Router {
    Router::new()
        .route("/api/config", get(handle_get_config))
        .route("/api/config", put(handle_put_config))
        .route("/api/auth/status", get(auth_api::handle_status))
        .route("/api/auth/login", post(auth_api::handle_login))
        .route("/api/auth/logout", post(auth_api::handle_logout))
        .route("/auth/callback", get(auth_api::handle_callback))
        .route("/api/process/status", get(process::handle_status))
        .route("/api/process/start", post(process::handle_start))
        .route("/api/process/stop", post(process::handle_stop))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            MAX_CONFIG_BODY,
        ))
        .with_state(state)
}

/// Run the launcher HTTP server until the process is killed.
pub async fn run_launcher(host: &str, port: u16, config_path: PathBuf) -> Result<()> {
    let state = Arc::new(LauncherState::new(config_path));
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("PicoClaw launcher listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// GET /api/config
async fn handle_get_config(State(state): State<Arc<LauncherState>>) -> axum::response::Response {
    match crate::config::load_config(&state.config_path) {
        Ok(cfg) => Json(serde_json::json!({
            "config": cfg,
            "path": state.config_path.display().to_string(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load config: {e:#}"),
        )
            .into_response(),
    }
}

/// PUT /api/config — full document replace, validated before save.
async fn handle_put_config(
    State(state): State<Arc<LauncherState>>,
    body: String,
) -> axum::response::Response {
    let cfg: crate::config::Config = match serde_json::from_str(&body) {
        Ok(cfg) => cfg,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}")).into_response();
        }
    };

    match crate::config::save_config(&state.config_path, &cfg) {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save config: {e:#}"),
        )
            .into_response(),
    }
}
