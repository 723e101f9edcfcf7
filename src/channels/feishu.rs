//! Feishu (Lark) channel — long-connection WebSocket for events, Open API for
//! replies. The endpoint is negotiated per-connection via the callback
//! endpoint API using the app credentials.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::FeishuConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

const BASE_URL: &str = "https://open.feishu.cn/open-apis";
const RECONNECT_DELAY_SECS: u64 = 5;

pub struct FeishuChannel {
    base: Arc<BaseChannel>,
    config: FeishuConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl FeishuChannel {
    pub fn new(config: FeishuConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("feishu", bus, config.allow_from.to_vec())),
            config,
            client: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }

    /// Obtain a tenant access token for Open API calls.
    async fn tenant_access_token(&self) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "app_id": self.config.app_id,
            "app_secret": self.config.app_secret,
        });
        let resp: serde_json::Value = self
            .client
            .post(format!(
                "{BASE_URL}/auth/v3/tenant_access_token/internal"
            ))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        let code = resp.get("code").and_then(serde_json::Value::as_i64);
        if code != Some(0) {
            anyhow::bail!(
                "feishu tenant_access_token failed: {}",
                resp.get("msg").and_then(|m| m.as_str()).unwrap_or("?")
            );
        }
        resp.get("tenant_access_token")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("feishu token response missing tenant_access_token"))
    }
}

#[async_trait]
impl Channel for FeishuChannel {
    fn name(&self) -> &'static str {
        "feishu"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.app_id.is_empty() || self.config.app_secret.is_empty() {
            anyhow::bail!("feishu app_id and app_secret not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(event_loop(
            Arc::clone(&self.base),
            self.client.clone(),
            self.config.app_id.clone(),
            self.config.app_secret.clone(),
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("Feishu channel started (long connection)");
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

        let token = self
            .tenant_access_token()
            .await
            .map_err(|e| ChannelError::temporary(e.to_string()))?;

        let receive_id_type = if msg.chat_id.starts_with("ou_") {
            "open_id"
        } else {
            "chat_id"
        };
        let content = serde_json::json!({ "text": msg.content }).to_string();
        let body = serde_json::json!({
            "receive_id": msg.chat_id,
            "msg_type": "text",
            "content": content,
        });

        let resp: serde_json::Value = self
            .client
            .post(format!(
                "{BASE_URL}/im/v1/messages?receive_id_type={receive_id_type}"
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("feishu send: {e}")))?
            .json()
            .await
            .map_err(|e| ChannelError::temporary(format!("feishu send decode: {e}")))?;

        match resp.get("code").and_then(serde_json::Value::as_i64) {
            Some(0) => Ok(()),
            Some(230_002) => Err(ChannelError::permanent(format!(
                "feishu unknown receive_id {}",
                msg.chat_id
            ))),
            other => Err(ChannelError::temporary(format!(
                "feishu send failed (code {other:?}): {}",
                resp.get("msg").and_then(|m| m.as_str()).unwrap_or("?")
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn event_loop(
    base: Arc<BaseChannel>,
    client: reqwest::Client,
    app_id: String,
    app_secret: String,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_connection_once(&base, &client, &app_id, &app_secret, &shutdown).await {
            Ok(()) => tracing::info!("Feishu connection closed, reconnecting"),
            Err(e) => tracing::warn!("Feishu connection error: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

async fn run_connection_once(
    base: &Arc<BaseChannel>,
    client: &reqwest::Client,
    app_id: &str,
    app_secret: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    // Negotiate a websocket endpoint for this app.
    let resp: serde_json::Value = client
        .post("https://open.feishu.cn/callback/ws/endpoint")
        .json(&serde_json::json!({"AppID": app_id, "AppSecret": app_secret}))
        .send()
        .await?
        .json()
        .await?;

    let ws_url = resp
        .get("data")
        .and_then(|d| d.get("URL"))
        .and_then(|u| u.as_str())
        .ok_or_else(|| anyhow::anyhow!("feishu endpoint negotiation returned no URL"))?;

    let (ws, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(std::time::Duration::from_secs(30));

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            _ = ping.tick() => {
                write.send(WsMsg::Ping(vec![])).await?;
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

        let event: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let event_type = event
            .get("header")
            .and_then(|h| h.get("event_type"))
            .and_then(|t| t.as_str())
            .unwrap_or("");
        if event_type == "im.message.receive_v1" {
            if let Some(payload) = event.get("event") {
                handle_message_event(base, payload);
            }
        }
    }
}

fn handle_message_event(base: &BaseChannel, event: &serde_json::Value) {
    let message = event.get("message");
    let msg_type = message
        .and_then(|m| m.get("message_type"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    if msg_type != "text" {
        return;
    }

    let sender_id = event
        .get("sender")
        .and_then(|s| s.get("sender_id"))
        .and_then(|i| i.get("open_id"))
        .and_then(|o| o.as_str())
        .unwrap_or_default();
    if sender_id.is_empty() {
        return;
    }

    let message_id = message
        .and_then(|m| m.get("message_id"))
        .and_then(|i| i.as_str())
        .unwrap_or_default();
    let chat_id = message
        .and_then(|m| m.get("chat_id"))
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let chat_type = message
        .and_then(|m| m.get("chat_type"))
        .and_then(|c| c.as_str())
        .unwrap_or("p2p");

    // Text content arrives as an escaped JSON string: {"text":"..."}
    let raw_content = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("{}");
    let text = serde_json::from_str::<serde_json::Value>(raw_content)
        .ok()
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default();

    let (kind, peer_id) = if chat_type == "p2p" {
        (PeerKind::Direct, sender_id.to_string())
    } else {
        (PeerKind::Group, chat_id.to_string())
    };

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), peer_id.clone());
    metadata.insert("chat_id".into(), chat_id.to_string());

    base.handle_message(
        Peer { kind, id: peer_id },
        message_id,
        &text,
        vec![],
        metadata,
        SenderInfo::new("feishu", sender_id),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Arc<MessageBus>, FeishuChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = FeishuConfig {
            enabled: true,
            app_id: "cli_a".into(),
            app_secret: "s".into(),
            encrypt_key: String::new(),
            verification_token: String::new(),
            allow_from: vec![].into(),
        };
        (bus.clone(), FeishuChannel::new(config, bus))
    }

    #[tokio::test]
    async fn p2p_text_message_is_direct_to_sender() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_abc"}},
            "message": {
                "message_id": "om_1",
                "chat_id": "oc_1",
                "chat_type": "p2p",
                "message_type": "text",
                "content": "{\"text\":\"hello\"}",
            }
        });
        handle_message_event(&ch.base, &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("ou_abc"));
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.sender.canonical_id, "feishu:ou_abc");
    }

    #[tokio::test]
    async fn group_text_message_addresses_chat() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_abc"}},
            "message": {
                "message_id": "om_2",
                "chat_id": "oc_group",
                "chat_type": "group",
                "message_type": "text",
                "content": "{\"text\":\"ping\"}",
            }
        });
        handle_message_event(&ch.base, &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::group("oc_group"));
    }

    #[tokio::test]
    async fn non_text_messages_are_ignored() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_abc"}},
            "message": {
                "message_id": "om_3",
                "chat_id": "oc_1",
                "chat_type": "p2p",
                "message_type": "image",
                "content": "{}",
            }
        });
        handle_message_event(&ch.base, &event);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn start_without_credentials_fails() {
        let bus = Arc::new(MessageBus::new());
        let ch = FeishuChannel::new(FeishuConfig::default(), bus);
        assert!(ch.start().await.is_err());
    }
}
