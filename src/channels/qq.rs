//! QQ official bot channel — WebSocket gateway with app-credential token
//! refresh. Handles direct (C2C) messages and group @-mentions.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::QQConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

const TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
const API_BASE: &str = "https://api.sgroup.qq.com";
const RECONNECT_DELAY_SECS: u64 = 5;

// C2C_MESSAGE_CREATE + GROUP_AT_MESSAGE_CREATE live in this intent bit.
const GROUP_AND_C2C_INTENT: u64 = 1 << 25;

pub struct QQChannel {
    base: Arc<BaseChannel>,
    config: QQConfig,
    client: reqwest::Client,
    access_token: Arc<RwLock<String>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl QQChannel {
    pub fn new(config: QQConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("qq", bus, config.allow_from.to_vec())),
            config,
            client: reqwest::Client::new(),
            access_token: Arc::new(RwLock::new(String::new())),
            shutdown: Mutex::new(None),
        }
    }

    fn bearer(&self) -> String {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        format!("QQBot {token}")
    }
}

#[async_trait]
impl Channel for QQChannel {
    fn name(&self) -> &'static str {
        "qq"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.app_id.is_empty() || self.config.app_secret.is_empty() {
            anyhow::bail!("qq app_id and app_secret not configured");
        }

        // First token fetch is synchronous so a bad secret fails Start.
        let (token_value, expires_in) = fetch_access_token(
            &self.client,
            &self.config.app_id,
            &self.config.app_secret,
        )
        .await?;
        *self
            .access_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token_value;

        let shutdown = CancellationToken::new();
        tokio::spawn(token_refresh_loop(
            self.client.clone(),
            self.config.app_id.clone(),
            self.config.app_secret.clone(),
            Arc::clone(&self.access_token),
            expires_in,
            shutdown.clone(),
        ));
        tokio::spawn(gateway_loop(
            Arc::clone(&self.base),
            self.client.clone(),
            Arc::clone(&self.access_token),
            shutdown.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(shutdown);
        self.base.set_running(true);
        tracing::info!("QQ channel started (websocket mode)");
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

        // Inbound peers are encoded as "group:<openid>" / "user:<openid>".
        let url = match msg.chat_id.split_once(':') {
            Some(("group", id)) => format!("{API_BASE}/v2/groups/{id}/messages"),
            Some(("user", id)) => format!("{API_BASE}/v2/users/{id}/messages"),
            _ => format!("{API_BASE}/v2/users/{}/messages", msg.chat_id),
        };

        let body = serde_json::json!({
            "content": msg.content,
            "msg_type": 0,
            "msg_id": msg.reply_to_message_id,
        });

        let resp = self
            .client
            .post(url)
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("qq send: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            400 | 404 => Err(ChannelError::permanent(format!(
                "qq rejected message for {} ({})",
                msg.chat_id,
                resp.status()
            ))),
            _ => Err(ChannelError::temporary(format!(
                "qq send returned {}",
                resp.status()
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn fetch_access_token(
    client: &reqwest::Client,
    app_id: &str,
    app_secret: &str,
) -> anyhow::Result<(String, u64)> {
    let resp: serde_json::Value = client
        .post(TOKEN_URL)
        .json(&serde_json::json!({"appId": app_id, "clientSecret": app_secret}))
        .send()
        .await?
        .json()
        .await?;

    let token = resp
        .get("access_token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("qq token response missing access_token"))?;
    let expires_in = resp
        .get("expires_in")
        .and_then(|e| e.as_str().map(|s| s.parse().ok()).unwrap_or(e.as_u64()))
        .unwrap_or(7200);
    Ok((token.to_string(), expires_in))
}

/// Refresh the app access token ahead of expiry.
async fn token_refresh_loop(
    client: reqwest::Client,
    app_id: String,
    app_secret: String,
    slot: Arc<RwLock<String>>,
    mut expires_in: u64,
    shutdown: CancellationToken,
) {
    loop {
        let refresh_in = std::time::Duration::from_secs(expires_in.saturating_sub(60).max(30));
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(refresh_in) => {}
        }

        match fetch_access_token(&client, &app_id, &app_secret).await {
            Ok((token, next_expiry)) => {
                *slot.write().unwrap_or_else(std::sync::PoisonError::into_inner) = token;
                expires_in = next_expiry;
            }
            Err(e) => {
                tracing::warn!("QQ token refresh failed: {e}");
                expires_in = 60;
            }
        }
    }
}

async fn gateway_loop(
    base: Arc<BaseChannel>,
    client: reqwest::Client,
    access_token: Arc<RwLock<String>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_gateway_once(&base, &client, &access_token, &shutdown).await {
            Ok(()) => tracing::info!("QQ gateway closed, reconnecting"),
            Err(e) => tracing::warn!("QQ gateway error: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

async fn run_gateway_once(
    base: &Arc<BaseChannel>,
    client: &reqwest::Client,
    access_token: &Arc<RwLock<String>>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let bearer = {
        let token = access_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        format!("QQBot {token}")
    };

    let resp: serde_json::Value = client
        .get(format!("{API_BASE}/gateway"))
        .header("Authorization", &bearer)
        .send()
        .await?
        .json()
        .await?;
    let ws_url = resp
        .get("url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| anyhow::anyhow!("qq gateway returned no url"))?;

    let (ws, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (mut write, mut read) = ws.split();

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(41));
    let mut last_seq: Option<i64> = None;

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            _ = heartbeat.tick() => {
                let hb = serde_json::json!({"op": 1, "d": last_seq});
                write.send(WsMsg::Text(hb.to_string())).await?;
                continue;
            }
            f = read.next() => f,
        };

        let text = match frame {
            Some(Ok(WsMsg::Text(t))) => t,
            Some(Ok(WsMsg::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        let payload: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if let Some(s) = payload.get("s").and_then(serde_json::Value::as_i64) {
            last_seq = Some(s);
        }

        match payload.get("op").and_then(serde_json::Value::as_i64) {
            Some(10) => {
                let interval_ms = payload
                    .get("d")
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(41_000);
                heartbeat =
                    tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1000)));
                heartbeat.reset();

                let identify = serde_json::json!({
                    "op": 2,
                    "d": {"token": bearer, "intents": GROUP_AND_C2C_INTENT, "shard": [0, 1]},
                });
                write.send(WsMsg::Text(identify.to_string())).await?;
            }
            Some(7) | Some(9) => return Ok(()),
            Some(0) => {
                let event_type = payload.get("t").and_then(|t| t.as_str()).unwrap_or("");
                if let Some(data) = payload.get("d") {
                    match event_type {
                        "C2C_MESSAGE_CREATE" => handle_c2c_message(base, data),
                        "GROUP_AT_MESSAGE_CREATE" => handle_group_at_message(base, data),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
}

fn handle_c2c_message(base: &BaseChannel, data: &serde_json::Value) {
    let Some(sender_id) = data
        .get("author")
        .and_then(|a| a.get("user_openid").or_else(|| a.get("id")))
        .and_then(|i| i.as_str())
    else {
        tracing::warn!("QQ C2C message with no sender id");
        return;
    };
    let content = data
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message_id = data.get("id").and_then(|i| i.as_str()).unwrap_or_default();

    let chat_id = format!("user:{sender_id}");
    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), PeerKind::Direct.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());

    base.handle_message(
        Peer::direct(chat_id),
        message_id,
        content,
        vec![],
        metadata,
        SenderInfo::new("qq", sender_id),
    );
}

fn handle_group_at_message(base: &BaseChannel, data: &serde_json::Value) {
    let Some(sender_id) = data
        .get("author")
        .and_then(|a| a.get("member_openid").or_else(|| a.get("id")))
        .and_then(|i| i.as_str())
    else {
        tracing::warn!("QQ group message with no sender id");
        return;
    };
    let Some(group_id) = data.get("group_openid").and_then(|g| g.as_str()) else {
        return;
    };
    let content = data
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message_id = data.get("id").and_then(|i| i.as_str()).unwrap_or_default();

    let chat_id = format!("group:{group_id}");
    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), PeerKind::Group.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());
    metadata.insert("group_id".into(), group_id.to_string());

    base.handle_message(
        Peer::group(chat_id),
        message_id,
        content,
        vec![],
        metadata,
        SenderInfo::new("qq", sender_id),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Arc<MessageBus>, QQChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = QQConfig {
            enabled: true,
            app_id: "app".into(),
            app_secret: "secret".into(),
            allow_from: vec![].into(),
        };
        (bus.clone(), QQChannel::new(config, bus))
    }

    #[tokio::test]
    async fn c2c_message_is_direct() {
        let (bus, ch) = channel();
        let data = serde_json::json!({
            "id": "abc",
            "content": "hi",
            "author": {"user_openid": "OPEN1"},
        });
        handle_c2c_message(&ch.base, &data);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("user:OPEN1"));
        assert_eq!(msg.metadata.get("peer_kind").map(String::as_str), Some("direct"));
    }

    #[tokio::test]
    async fn group_at_message_is_group() {
        let (bus, ch) = channel();
        let data = serde_json::json!({
            "id": "g-msg",
            "content": " what is up ",
            "author": {"member_openid": "MEMBER1"},
            "group_openid": "GROUP9",
        });
        handle_group_at_message(&ch.base, &data);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::group("group:GROUP9"));
        assert_eq!(msg.metadata.get("peer_kind").map(String::as_str), Some("group"));
    }

    #[tokio::test]
    async fn duplicate_delivery_publishes_once() {
        let (bus, ch) = channel();
        let data = serde_json::json!({
            "id": "abc",
            "content": "hi",
            "author": {"user_openid": "OPEN1"},
        });
        let before = ch.base.seen_ids_len();
        handle_c2c_message(&ch.base, &data);
        handle_c2c_message(&ch.base, &data);
        assert_eq!(ch.base.seen_ids_len(), before + 1);
        let _ = bus.next_inbound().await;
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn send_while_stopped_is_not_running() {
        let (_bus, ch) = channel();
        let err = ch
            .send(&OutboundMessage {
                channel: "qq".into(),
                chat_id: "user:OPEN1".into(),
                content: "x".into(),
                reply_to_message_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotRunning));
    }
}
