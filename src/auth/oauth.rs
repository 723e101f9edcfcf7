//! OAuth primitives: PKCE generation, authorize-URL construction, code and
//! device-code exchanges, and the provider endpoint table.

use super::AuthCredential;
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Endpoint set and client identity for one OAuth provider.
#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub provider: &'static str,
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub device_auth_url: &'static str,
    pub client_id: &'static str,
    pub client_secret: &'static str,
    pub scopes: &'static str,
}

/// OpenAI device-code login against the ChatGPT account OAuth service.
pub fn openai_oauth_config() -> OAuthProviderConfig {
    OAuthProviderConfig {
        provider: "openai",
        auth_url: "https://auth.openai.com/oauth/authorize",
        token_url: "https://auth.openai.com/oauth/token",
        device_auth_url: "https://auth.openai.com/oauth/device/authorization",
        client_id: "app_EMoamEEZ73f0CkXaXp7hrann",
        client_secret: "",
        scopes: "openid profile email offline_access",
    }
}

/// Google Antigravity (Cloud Code Assist) PKCE authorization-code login.
pub fn google_antigravity_oauth_config() -> OAuthProviderConfig {
    OAuthProviderConfig {
        provider: "google-antigravity",
        auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        device_auth_url: "",
        client_id:
            "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com",
        client_secret: "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",
        scopes: "https://www.googleapis.com/auth/cloud-platform \
                 https://www.googleapis.com/auth/userinfo.email \
                 https://www.googleapis.com/auth/userinfo.profile",
    }
}

/// Cloud Code Assist API endpoint (project-id discovery).
const CLOUDCODE_PA_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

// ── PKCE ────────────────────────────────────────────────────────────

/// PKCE pair for an authorization-code flow (S256 method).
#[derive(Debug, Clone)]
pub struct PkceCodes {
    /// Random code verifier (base64url of 32 random bytes).
    pub verifier: String,
    /// base64url(SHA-256(verifier)).
    pub challenge: String,
}

/// Generate a fresh PKCE pair. Each call is unique.
pub fn generate_pkce() -> PkceCodes {
    let mut rng = rand::rng();
    let mut verifier_bytes = [0u8; 32];
    rng.fill_bytes(&mut verifier_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkceCodes {
        verifier,
        challenge,
    }
}

/// Verify a challenge against a verifier (S256).
pub fn verify_pkce(verifier: &str, challenge: &str) -> bool {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())) == challenge
}

/// Random CSRF `state` parameter (128 bits).
pub fn generate_state() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the browser authorize URL for a PKCE flow.
pub fn build_authorize_url(
    cfg: &OAuthProviderConfig,
    pkce: &PkceCodes,
    state: &str,
    redirect_uri: &str,
) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}\
         &code_challenge={}&code_challenge_method=S256&state={}\
         &access_type=offline&prompt=consent",
        cfg.auth_url,
        url_encode(cfg.client_id),
        url_encode(redirect_uri),
        url_encode(cfg.scopes),
        pkce.challenge,
        url_encode(state),
    )
}

// ── Token exchange ──────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn credential_from_token_response(
    provider: &str,
    auth_method: &str,
    resp: TokenResponse,
) -> AuthCredential {
    AuthCredential {
        provider: provider.to_string(),
        auth_method: auth_method.to_string(),
        access_token: resp.access_token,
        refresh_token: resp.refresh_token,
        expires_at: resp
            .expires_in
            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs as i64)),
        account_id: None,
        email: None,
        project_id: None,
    }
}

/// Exchange an authorization code (plus PKCE verifier) for tokens.
pub async fn exchange_code_for_tokens(
    cfg: &OAuthProviderConfig,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<AuthCredential> {
    let client = reqwest::Client::new();
    let mut form = format!(
        "grant_type=authorization_code&client_id={}&code={}&redirect_uri={}&code_verifier={}",
        url_encode(cfg.client_id),
        url_encode(code),
        url_encode(redirect_uri),
        url_encode(verifier),
    );
    if !cfg.client_secret.is_empty() {
        form.push_str(&format!("&client_secret={}", url_encode(cfg.client_secret)));
    }

    let resp = client
        .post(cfg.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .timeout(std::time::Duration::from_secs(10))
        .body(form)
        .send()
        .await
        .context("failed to exchange OAuth code for tokens")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OAuth token exchange failed ({status}): {body}");
    }

    let token: TokenResponse = resp
        .json()
        .await
        .context("failed to parse OAuth token response")?;
    Ok(credential_from_token_response(cfg.provider, "oauth", token))
}

// ── Device code flow ────────────────────────────────────────────────

/// Server response to a device authorization request.
#[derive(Debug, Clone)]
pub struct DeviceCodeInfo {
    pub verify_url: String,
    pub user_code: String,
    pub device_auth_id: String,
    /// Polling interval in seconds.
    pub interval: u64,
}

/// Request a device code from the provider.
pub async fn request_device_code(cfg: &OAuthProviderConfig) -> Result<DeviceCodeInfo> {
    let client = reqwest::Client::new();
    let resp = client
        .post(cfg.device_auth_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .timeout(std::time::Duration::from_secs(10))
        .body(format!(
            "client_id={}&scope={}",
            url_encode(cfg.client_id),
            url_encode(cfg.scopes),
        ))
        .send()
        .await
        .context("failed to request device code")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("device code request failed ({status}): {body}");
    }

    #[derive(serde::Deserialize)]
    struct DeviceResponse {
        device_code: String,
        user_code: String,
        #[serde(default)]
        verification_uri: Option<String>,
        #[serde(default)]
        verification_uri_complete: Option<String>,
        #[serde(default = "default_interval")]
        interval: u64,
    }
    fn default_interval() -> u64 {
        5
    }

    let parsed: DeviceResponse = resp
        .json()
        .await
        .context("failed to parse device code response")?;
    let verify_url = parsed
        .verification_uri_complete
        .or(parsed.verification_uri)
        .ok_or_else(|| anyhow::anyhow!("device code response missing verification_uri"))?;
    Ok(DeviceCodeInfo {
        verify_url,
        user_code: parsed.user_code,
        device_auth_id: parsed.device_code,
        interval: parsed.interval.max(1),
    })
}

/// One poll of the device-code token endpoint. `Ok(None)` means the user has
/// not finished yet; `Err` means the grant is dead (denied or expired).
pub async fn poll_device_code_once(
    cfg: &OAuthProviderConfig,
    device_auth_id: &str,
) -> Result<Option<AuthCredential>> {
    let client = reqwest::Client::new();
    let resp = client
        .post(cfg.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Accept", "application/json")
        .timeout(std::time::Duration::from_secs(10))
        .body(format!(
            "grant_type=urn:ietf:params:oauth:grant-type:device_code&device_code={}&client_id={}",
            url_encode(device_auth_id),
            url_encode(cfg.client_id),
        ))
        .send()
        .await
        .context("device code poll failed")?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();

    if status.is_success() {
        let token: TokenResponse =
            serde_json::from_value(body).context("failed to parse device token response")?;
        return Ok(Some(credential_from_token_response(
            cfg.provider,
            "oauth",
            token,
        )));
    }

    match body.get("error").and_then(|e| e.as_str()) {
        Some("authorization_pending") | Some("slow_down") => Ok(None),
        Some(other) => anyhow::bail!("device code grant failed: {other}"),
        None => anyhow::bail!("device code poll returned {status}"),
    }
}

// ── Post-login profile fetches ──────────────────────────────────────

/// Fetch the user's email from Google's userinfo endpoint.
pub async fn fetch_google_user_email(access_token: &str) -> Result<String> {
    let client = reqwest::Client::new();
    let resp = client
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .bearer_auth(access_token)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("userinfo request failed: {}", resp.status());
    }

    #[derive(serde::Deserialize)]
    struct UserInfo {
        email: String,
    }
    let info: UserInfo = resp.json().await?;
    Ok(info.email)
}

/// Discover the Cloud Code Assist project id for an Antigravity login.
pub async fn fetch_antigravity_project_id(access_token: &str) -> Result<String> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{CLOUDCODE_PA_ENDPOINT}/v1internal:loadCodeAssist"
        ))
        .bearer_auth(access_token)
        .timeout(std::time::Duration::from_secs(10))
        .json(&serde_json::json!({"metadata": {"pluginType": "ANTIGRAVITY"}}))
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("loadCodeAssist request failed: {}", resp.status());
    }

    let body: serde_json::Value = resp.json().await?;
    body.get("cloudaicompanionProject")
        .and_then(|p| p.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("loadCodeAssist response missing project id"))
}

/// Minimal percent-encoding for query parameter values.
pub fn url_encode(s: &str) -> String {
    use std::fmt::Write;
    let mut result = String::with_capacity(s.len() * 2);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                let _ = write!(result, "%{byte:02X}");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let pkce = generate_pkce();
        assert!(verify_pkce(&pkce.verifier, &pkce.challenge));
        assert!(!verify_pkce("wrong-verifier", &pkce.challenge));
    }

    #[test]
    fn pkce_is_unique_each_call() {
        let a = generate_pkce();
        let b = generate_pkce();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn state_has_128_bits_of_entropy() {
        let state = generate_state();
        // 16 bytes base64url-encoded without padding is 22 chars.
        assert_eq!(state.len(), 22);
        assert_ne!(state, generate_state());
    }

    #[test]
    fn authorize_url_carries_challenge_and_state() {
        let cfg = google_antigravity_oauth_config();
        let pkce = generate_pkce();
        let url = build_authorize_url(&cfg, &pkce, "st4te", "http://localhost:1234/auth/callback");
        assert!(url.starts_with(cfg.auth_url));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("code_challenge={}", pkce.challenge)));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A1234%2Fauth%2Fcallback"));
    }

    #[test]
    fn url_encode_handles_special_chars() {
        assert_eq!(url_encode("hello world"), "hello%20world");
        assert_eq!(url_encode("a+b"), "a%2Bb");
        assert_eq!(url_encode("foo@bar.com"), "foo%40bar.com");
    }

    #[test]
    fn token_response_maps_expiry() {
        let cred = credential_from_token_response(
            "openai",
            "oauth",
            TokenResponse {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_in: Some(3600),
            },
        );
        assert_eq!(cred.provider, "openai");
        assert_eq!(cred.refresh_token.as_deref(), Some("rt"));
        let expires = cred.expires_at.unwrap();
        let delta = expires - chrono::Utc::now();
        assert!(delta.num_seconds() > 3500 && delta.num_seconds() <= 3600);
    }

    #[test]
    fn provider_configs_are_complete() {
        let openai = openai_oauth_config();
        assert!(!openai.device_auth_url.is_empty());
        let antigravity = google_antigravity_oauth_config();
        assert!(antigravity.auth_url.starts_with("https://accounts.google.com"));
        assert!(!antigravity.client_id.is_empty());
    }
}
