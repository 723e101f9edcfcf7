//! LINE channel — webhook receiver for events, Messaging API for replies.
//! Webhook requests are authenticated with the `X-Line-Signature` header
//! (HMAC-SHA256 of the raw body with the channel secret).

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::LineConfig;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const API_BASE: &str = "https://api.line.me/v2/bot";

pub struct LineChannel {
    base: Arc<BaseChannel>,
    config: LineConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
struct WebhookState {
    base: Arc<BaseChannel>,
    channel_secret: String,
}

impl LineChannel {
    pub fn new(config: LineConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("line", bus, config.allow_from.to_vec())),
            config,
            client: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for LineChannel {
    fn name(&self) -> &'static str {
        "line"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.channel_secret.is_empty() || self.config.channel_access_token.is_empty() {
            anyhow::bail!("line channel_secret and channel_access_token not configured");
        }

        let state = WebhookState {
            base: Arc::clone(&self.base),
            channel_secret: self.config.channel_secret.clone(),
        };
        let app = Router::new()
            .route(&self.config.webhook_path, post(handle_webhook))
            .with_state(state);

        let addr = format!("{}:{}", self.config.webhook_host, self.config.webhook_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            "LINE webhook listening on http://{addr}{}",
            self.config.webhook_path
        );

        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move {
            let shutdown = async move { serve_token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::warn!("LINE webhook server error: {e}");
            }
        });

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(token) = self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.base.is_running() {
            return Err(ChannelError::NotRunning);
        }

        let body = serde_json::json!({
            "to": msg.chat_id,
            "messages": [{"type": "text", "text": msg.content}],
        });

        let resp = self
            .client
            .post(format!("{API_BASE}/message/push"))
            .bearer_auth(&self.config.channel_access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("line push: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            400 => Err(ChannelError::permanent(format!(
                "line rejected push to {}",
                msg.chat_id
            ))),
            _ => Err(ChannelError::temporary(format!(
                "line push returned {}",
                resp.status()
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// Verify the webhook signature: base64(HMAC-SHA256(channel_secret, body)).
fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = BASE64.encode(mac.finalize().into_bytes());
    expected == signature
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get("X-Line-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&state.channel_secret, &body, signature) {
        tracing::warn!("LINE webhook signature verification failed");
        return StatusCode::FORBIDDEN;
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return StatusCode::BAD_REQUEST;
    };

    if let Some(events) = payload.get("events").and_then(|e| e.as_array()) {
        for event in events {
            handle_event(&state.base, event);
        }
    }
    StatusCode::OK
}

fn handle_event(base: &BaseChannel, event: &serde_json::Value) {
    if event.get("type").and_then(|t| t.as_str()) != Some("message") {
        return;
    }
    let message = event.get("message");
    if message.and_then(|m| m.get("type")).and_then(|t| t.as_str()) != Some("text") {
        return;
    }

    let Some(user_id) = event
        .get("source")
        .and_then(|s| s.get("userId"))
        .and_then(|u| u.as_str())
    else {
        return;
    };
    let text = message
        .and_then(|m| m.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    let message_id = message
        .and_then(|m| m.get("id"))
        .and_then(|i| i.as_str())
        .unwrap_or_default();

    let source_type = event
        .get("source")
        .and_then(|s| s.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("user");
    let (kind, chat_id) = match source_type {
        "group" => (
            PeerKind::Group,
            event
                .get("source")
                .and_then(|s| s.get("groupId"))
                .and_then(|g| g.as_str())
                .unwrap_or(user_id)
                .to_string(),
        ),
        "room" => (
            PeerKind::Group,
            event
                .get("source")
                .and_then(|s| s.get("roomId"))
                .and_then(|r| r.as_str())
                .unwrap_or(user_id)
                .to_string(),
        ),
        _ => (PeerKind::Direct, user_id.to_string()),
    };

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());
    if let Some(reply_token) = event.get("replyToken").and_then(|r| r.as_str()) {
        metadata.insert("reply_token".into(), reply_token.to_string());
    }

    base.handle_message(
        Peer { kind, id: chat_id },
        message_id,
        text,
        vec![],
        metadata,
        SenderInfo::new("line", user_id),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Arc<MessageBus>, LineChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = LineConfig {
            enabled: true,
            channel_secret: "secret".into(),
            channel_access_token: "token".into(),
            ..LineConfig::default()
        };
        (bus.clone(), LineChannel::new(config, bus))
    }

    #[test]
    fn signature_round_trip_verifies() {
        let secret = "test-secret";
        let body = br#"{"events":[]}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = BASE64.encode(mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &sig));
        assert!(!verify_signature(secret, body, "bogus"));
        assert!(!verify_signature("other-secret", body, &sig));
    }

    #[tokio::test]
    async fn user_text_event_is_direct() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "replyToken": "rt1",
            "source": {"type": "user", "userId": "U123"},
            "message": {"type": "text", "id": "m1", "text": "hello"},
        });
        handle_event(&ch.base, &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("U123"));
        assert_eq!(msg.metadata.get("reply_token").map(String::as_str), Some("rt1"));
    }

    #[tokio::test]
    async fn group_text_event_addresses_group() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "source": {"type": "group", "groupId": "G9", "userId": "U123"},
            "message": {"type": "text", "id": "m2", "text": "hi all"},
        });
        handle_event(&ch.base, &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::group("G9"));
    }

    #[tokio::test]
    async fn sticker_events_are_ignored() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "source": {"type": "user", "userId": "U123"},
            "message": {"type": "sticker", "id": "m3"},
        });
        handle_event(&ch.base, &event);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }
}
