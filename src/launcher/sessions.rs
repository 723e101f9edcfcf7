//! In-flight login session state: the state-keyed OAuth session map for
//! browser PKCE flows and the singleton device-code session.

use crate::auth::oauth::{OAuthProviderConfig, PkceCodes};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Browser PKCE sessions expire after ten minutes.
const OAUTH_SESSION_TTL_MINUTES: i64 = 10;

/// In-flight OAuth state for a browser-based PKCE flow, keyed by `state`.
pub struct OAuthSession {
    pub provider: String,
    pub pkce: PkceCodes,
    pub redirect_uri: String,
    pub oauth_cfg: OAuthProviderConfig,
    pub config_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl OAuthSession {
    fn is_expired(&self) -> bool {
        self.created_at + Duration::minutes(OAUTH_SESSION_TTL_MINUTES) <= Utc::now()
    }
}

/// State-keyed session map. Insertion, single-use removal and GC of expired
/// entries all happen under one lock.
#[derive(Default)]
pub struct OAuthSessions {
    sessions: Mutex<HashMap<String, OAuthSession>>,
}

impl OAuthSessions {
    pub fn insert(&self, state: String, session: OAuthSession) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.retain(|_, s| !s.is_expired());
        sessions.insert(state, session);
    }

    /// Single-use lookup: the session is removed whether or not it is still
    /// valid, so a state value can never be replayed.
    pub fn take(&self, state: &str) -> Option<OAuthSession> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions.remove(state)?;
        if session.is_expired() {
            return None;
        }
        Some(session)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Terminal status of a device-code login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Pending,
    Success,
    Error,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Mutable half of a device-code session, owned by the poller.
pub struct DeviceProgress {
    pub status: DeviceStatus,
    pub error: Option<String>,
    pub done: bool,
}

/// One device-code login attempt. At most one exists system-wide.
pub struct DeviceCodeSession {
    pub provider: String,
    pub verify_url: String,
    pub user_code: String,
    pub progress: Mutex<DeviceProgress>,
}

impl DeviceCodeSession {
    pub fn new(provider: &str, verify_url: String, user_code: String) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.to_string(),
            verify_url,
            user_code,
            progress: Mutex::new(DeviceProgress {
                status: DeviceStatus::Pending,
                error: None,
                done: false,
            }),
        })
    }

    pub fn finish(&self, status: DeviceStatus, error: Option<String>) {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        progress.status = status;
        progress.error = error;
        progress.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .done
    }
}

/// Holder for the singleton active device session.
#[derive(Default)]
pub struct ActiveDeviceSession {
    slot: Mutex<Option<Arc<DeviceCodeSession>>>,
}

impl ActiveDeviceSession {
    /// A login request while one is pending and not done returns the existing
    /// session (idempotent login).
    pub fn pending(&self) -> Option<Arc<DeviceCodeSession>> {
        let slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.as_ref().filter(|s| !s.is_done()).cloned()
    }

    /// Current session regardless of completion, clearing it once done so a
    /// finished attempt is reported exactly once.
    pub fn snapshot_and_clear_done(&self) -> Option<Arc<DeviceCodeSession>> {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = slot.clone()?;
        if session.is_done() {
            *slot = None;
        }
        Some(session)
    }

    pub fn replace(&self, session: Arc<DeviceCodeSession>) {
        *self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session);
    }
}
