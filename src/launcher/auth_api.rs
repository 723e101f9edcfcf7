//! Auth HTTP handlers: provider login/logout/status and the OAuth browser
//! callback.

use super::sessions::{DeviceCodeSession, DeviceStatus, OAuthSession};
use super::LauncherState;
use crate::auth::{self, oauth, AuthCredential};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Device-code logins give up after fifteen minutes.
const DEVICE_CODE_DEADLINE: Duration = Duration::from_secs(15 * 60);

#[derive(serde::Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    token: Option<String>,
}

/// POST /api/auth/login
pub async fn handle_login(
    State(state): State<Arc<LauncherState>>,
    headers: HeaderMap,
    body: Result<Json<LoginRequest>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(req)) = body else {
        return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
    };

    match req.provider.as_str() {
        "openai" => handle_openai_login(&state).await.into_response(),
        "anthropic" => {
            handle_anthropic_login(&state, req.token.as_deref().unwrap_or("")).into_response()
        }
        "google-antigravity" | "antigravity" => {
            handle_antigravity_login(&state, &headers).into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("Unsupported provider: {other} (supported: openai, anthropic, google-antigravity)"),
        )
            .into_response(),
    }
}

/// OpenAI device-code flow. A second login while one is pending returns the
/// existing session unchanged.
async fn handle_openai_login(state: &Arc<LauncherState>) -> axum::response::Response {
    if let Some(existing) = state.device_session.pending() {
        return Json(json!({
            "status": "pending",
            "device_url": existing.verify_url,
            "user_code": existing.user_code,
            "message": "Device code flow already in progress. Enter the code in your browser.",
        }))
        .into_response();
    }

    let cfg = oauth::openai_oauth_config();
    let info = match oauth::request_device_code(&cfg).await {
        Ok(info) => info,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to request device code: {e:#}"),
            )
                .into_response();
        }
    };

    let verify_url = info.verify_url.clone();
    let user_code = info.user_code.clone();
    let session = DeviceCodeSession::new("openai", verify_url.clone(), user_code.clone());
    state.device_session.replace(Arc::clone(&session));

    let poll_state = Arc::clone(state);
    tokio::spawn(async move {
        poll_device_code(poll_state, session, cfg, info).await;
    });

    Json(json!({
        "status": "pending",
        "device_url": verify_url,
        "user_code": user_code,
        "message": "Open the URL and enter the code to authenticate.",
    }))
    .into_response()
}

async fn poll_device_code(
    state: Arc<LauncherState>,
    session: Arc<DeviceCodeSession>,
    cfg: oauth::OAuthProviderConfig,
    info: oauth::DeviceCodeInfo,
) {
    let deadline = tokio::time::Instant::now() + DEVICE_CODE_DEADLINE;
    let mut ticker = tokio::time::interval(Duration::from_secs(info.interval));
    ticker.tick().await; // the first tick is immediate; skip it

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                session.finish(
                    DeviceStatus::Error,
                    Some("Authentication timed out after 15 minutes".into()),
                );
                return;
            }
            _ = ticker.tick() => {}
        }

        match oauth::poll_device_code_once(&cfg, &info.device_auth_id).await {
            Ok(None) => continue,
            Ok(Some(cred)) => {
                if let Err(e) = auth::set_credential(&state.credentials_path, "openai", cred) {
                    session.finish(DeviceStatus::Error, Some(e.to_string()));
                    return;
                }
                super::auth_config::update_config_after_login(&state.config_path, "openai");
                session.finish(DeviceStatus::Success, None);
                tracing::info!("OpenAI device code login successful");
                return;
            }
            Err(e) => {
                session.finish(DeviceStatus::Error, Some(e.to_string()));
                return;
            }
        }
    }
}

/// Anthropic token paste.
fn handle_anthropic_login(state: &Arc<LauncherState>, token: &str) -> axum::response::Response {
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Token is required for Anthropic login",
        )
            .into_response();
    }

    let cred = AuthCredential {
        provider: "anthropic".into(),
        auth_method: "token".into(),
        access_token: token.to_string(),
        refresh_token: None,
        expires_at: None,
        account_id: None,
        email: None,
        project_id: None,
    };

    if let Err(e) = auth::set_credential(&state.credentials_path, "anthropic", cred) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save credentials: {e:#}"),
        )
            .into_response();
    }
    super::auth_config::update_config_after_login(&state.config_path, "anthropic");

    Json(json!({"status": "success", "message": "Anthropic token saved"})).into_response()
}

/// Google Antigravity PKCE: return the authorize URL and park the session
/// under its `state` key until the browser callback.
fn handle_antigravity_login(
    state: &Arc<LauncherState>,
    headers: &HeaderMap,
) -> axum::response::Response {
    let cfg = oauth::google_antigravity_oauth_config();
    let pkce = oauth::generate_pkce();
    let oauth_state = oauth::generate_state();

    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("127.0.0.1:18800");
    let redirect_uri = format!("http://{host}/auth/callback");

    let auth_url = oauth::build_authorize_url(&cfg, &pkce, &oauth_state, &redirect_uri);

    state.oauth_sessions.insert(
        oauth_state.clone(),
        OAuthSession {
            provider: "google-antigravity".into(),
            pkce,
            redirect_uri,
            oauth_cfg: cfg,
            config_path: state.config_path.clone(),
            created_at: chrono::Utc::now(),
        },
    );

    Json(json!({
        "status": "redirect",
        "auth_url": auth_url,
        "message": "Open the URL to authenticate with Google.",
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    error: Option<String>,
}

/// GET /auth/callback — browser lands here after Google consent.
pub async fn handle_callback(
    State(state): State<Arc<LauncherState>>,
    Query(query): Query<CallbackQuery>,
) -> axum::response::Response {
    // Single-use: the session is gone after this lookup.
    let Some(session) = state.oauth_sessions.take(&query.state) else {
        return (StatusCode::BAD_REQUEST, "Invalid or expired OAuth state").into_response();
    };

    if query.code.is_empty() {
        let msg = query.error.unwrap_or_default();
        return Html(format!(
            "<html><body><h2>Authentication failed</h2><p>{msg}</p>\
             <p>You can close this window.</p></body></html>"
        ))
        .into_response();
    }

    let mut cred = match oauth::exchange_code_for_tokens(
        &session.oauth_cfg,
        &query.code,
        &session.pkce.verifier,
        &session.redirect_uri,
    )
    .await
    {
        Ok(cred) => cred,
        Err(e) => {
            return Html(format!(
                "<html><body><h2>Authentication failed</h2><p>{e:#}</p>\
                 <p>You can close this window.</p></body></html>"
            ))
            .into_response();
        }
    };
    cred.provider = session.provider.clone();

    if session.provider == "google-antigravity" {
        if let Ok(email) = oauth::fetch_google_user_email(&cred.access_token).await {
            cred.email = Some(email);
        }
        if let Ok(project_id) = oauth::fetch_antigravity_project_id(&cred.access_token).await {
            cred.project_id = Some(project_id);
        }
    }

    if let Err(e) = auth::set_credential(&state.credentials_path, &session.provider, cred) {
        return Html(format!(
            "<html><body><h2>Failed to save credentials</h2><p>{e:#}</p></body></html>"
        ))
        .into_response();
    }
    super::auth_config::update_config_after_login(&state.config_path, &session.provider);

    Html(
        "<html><body>\
         <h2>Authentication successful!</h2>\
         <p>Redirecting back to Config Editor...</p>\
         <script>setTimeout(function(){ window.location.href = '/#auth'; }, 1000);</script>\
         </body></html>"
            .to_string(),
    )
    .into_response()
}

/// GET /api/auth/status
pub async fn handle_status(State(state): State<Arc<LauncherState>>) -> axum::response::Response {
    let store = match auth::load_store(&state.credentials_path) {
        Ok(store) => store,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load auth store: {e:#}"),
            )
                .into_response();
        }
    };

    let mut providers = Vec::new();
    for (name, cred) in &store.credentials {
        let status = if cred.is_expired() {
            "expired"
        } else if cred.needs_refresh() {
            "needs_refresh"
        } else {
            "active"
        };
        let mut entry = json!({
            "provider": name,
            "auth_method": cred.auth_method,
            "status": status,
        });
        if let Some(account_id) = &cred.account_id {
            entry["account_id"] = json!(account_id);
        }
        if let Some(email) = &cred.email {
            entry["email"] = json!(email);
        }
        if let Some(project_id) = &cred.project_id {
            entry["project_id"] = json!(project_id);
        }
        if let Some(expires_at) = &cred.expires_at {
            entry["expires_at"] = json!(expires_at.to_rfc3339());
        }
        providers.push(entry);
    }

    let pending_device = state.device_session.snapshot_and_clear_done().map(|session| {
        let progress = session
            .progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entry = json!({
            "provider": session.provider,
            "status": progress.status.as_str(),
            "device_url": session.verify_url,
            "user_code": session.user_code,
        });
        if let Some(error) = &progress.error {
            entry["error"] = json!(error);
        }
        entry
    });

    Json(json!({
        "providers": providers,
        "pending_device": pending_device,
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    provider: Option<String>,
}

/// POST /api/auth/logout — absent provider logs out everything.
pub async fn handle_logout(
    State(state): State<Arc<LauncherState>>,
    body: Result<Json<LogoutRequest>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(req)) = body else {
        return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
    };

    match req.provider.as_deref().filter(|p| !p.is_empty()) {
        None => {
            if let Err(e) = auth::delete_all_credentials(&state.credentials_path) {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to logout: {e:#}"),
                )
                    .into_response();
            }
            super::auth_config::clear_all_auth_methods_in_config(&state.config_path);
        }
        Some(provider) => {
            if let Err(e) = auth::delete_credential(&state.credentials_path, provider) {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to logout: {e:#}"),
                )
                    .into_response();
            }
            super::auth_config::clear_auth_method_in_config(&state.config_path, provider);
        }
    }

    Json(json!({"status": "ok"})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LauncherState;
    use tempfile::TempDir;

    fn launcher_state(tmp: &TempDir) -> Arc<LauncherState> {
        Arc::new(LauncherState::new(tmp.path().join("config.json"))
            .with_credentials_path(tmp.path().join("credentials.json")))
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_400() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        let resp = handle_callback(
            State(state),
            Query(CallbackQuery {
                state: "XYZ".into(),
                code: "some-code".into(),
                error: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        // No credential was written.
        assert!(!tmp.path().join("credentials.json").exists());
    }

    #[tokio::test]
    async fn anthropic_login_requires_token() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        let resp = handle_anthropic_login(&state, "");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn anthropic_login_persists_credential_and_config() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        crate::config::save_config(&state.config_path, &crate::config::Config::default()).unwrap();

        let resp = handle_anthropic_login(&state, "sk-ant-test");
        assert_eq!(resp.status(), StatusCode::OK);

        let cred = auth::get_credential(&state.credentials_path, "anthropic")
            .unwrap()
            .unwrap();
        assert_eq!(cred.auth_method, "token");
        assert_eq!(cred.access_token, "sk-ant-test");

        let cfg = crate::config::load_config(&state.config_path).unwrap();
        assert_eq!(cfg.providers.anthropic.auth_method.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn unknown_provider_is_400() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        let resp = handle_login(
            State(state),
            HeaderMap::new(),
            Ok(Json(LoginRequest {
                provider: "digital-carrier-pigeon".into(),
                token: None,
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn antigravity_login_parks_session_for_callback() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        let mut headers = HeaderMap::new();
        headers.insert("host", "127.0.0.1:18800".parse().unwrap());

        let resp = handle_antigravity_login(&state, &headers);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.oauth_sessions.len(), 1);
    }

    #[tokio::test]
    async fn logout_without_provider_clears_all() {
        let tmp = TempDir::new().unwrap();
        let state = launcher_state(&tmp);
        crate::config::save_config(&state.config_path, &crate::config::Config::default()).unwrap();
        handle_anthropic_login(&state, "sk-ant-test");

        let resp = handle_logout(
            State(Arc::clone(&state)),
            Ok(Json(LogoutRequest { provider: None })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(auth::load_store(&state.credentials_path)
            .unwrap()
            .credentials
            .is_empty());
    }
}
