//! Provider authentication: the credential store plus the OAuth machinery
//! (PKCE authorization-code and device-code flows).

pub mod oauth;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// How far ahead of expiry a credential is considered due for refresh.
const REFRESH_WINDOW_MINUTES: i64 = 5;

/// A stored provider credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCredential {
    pub provider: String,
    /// One of `oauth`, `token`, `device_code`.
    pub auth_method: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl AuthCredential {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    pub fn needs_refresh(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= Utc::now() + Duration::minutes(REFRESH_WINDOW_MINUTES))
    }
}

/// Provider-keyed credential file (`~/.picoclaw/credentials.json`), written
/// with owner-only permissions. One credential per provider.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(default)]
    pub credentials: HashMap<String, AuthCredential>,
}

/// Default store path.
pub fn default_store_path() -> PathBuf {
    crate::util::picoclaw_home().join("credentials.json")
}

pub fn load_store(path: &Path) -> Result<CredentialStore> {
    if !path.exists() {
        return Ok(CredentialStore::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse credentials from {}", path.display()))
}

fn save_store(path: &Path, store: &CredentialStore) -> Result<()> {
    let json = serde_json::to_string_pretty(store).context("failed to serialize credentials")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to write credentials to {}", path.display()))?;
        file.write_all(json.as_bytes())?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, json)
        .with_context(|| format!("failed to write credentials to {}", path.display()))?;

    Ok(())
}

pub fn set_credential(path: &Path, provider: &str, cred: AuthCredential) -> Result<()> {
    let mut store = load_store(path)?;
    store.credentials.insert(provider.to_string(), cred);
    save_store(path, &store)
}

pub fn get_credential(path: &Path, provider: &str) -> Result<Option<AuthCredential>> {
    Ok(load_store(path)?.credentials.remove(provider))
}

pub fn delete_credential(path: &Path, provider: &str) -> Result<()> {
    let mut store = load_store(path)?;
    store.credentials.remove(provider);
    save_store(path, &store)
}

pub fn delete_all_credentials(path: &Path) -> Result<()> {
    save_store(path, &CredentialStore::default())
}
