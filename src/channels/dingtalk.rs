//! DingTalk channel — Stream Mode WebSocket for events, per-session webhook
//! URLs for replies. DingTalk hands out a fresh webhook with each incoming
//! message, so the adapter remembers the latest one per chat.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::DingTalkConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(serde::Deserialize)]
struct GatewayResponse {
    endpoint: String,
    ticket: String,
}

pub struct DingTalkChannel {
    base: Arc<BaseChannel>,
    config: DingTalkConfig,
    client: reqwest::Client,
    session_webhooks: Arc<RwLock<HashMap<String, String>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl DingTalkChannel {
    pub fn new(config: DingTalkConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new(
                "dingtalk",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            client: reqwest::Client::new(),
            session_webhooks: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Mutex::new(None),
        }
    }

    async fn register_connection(
        client: &reqwest::Client,
        client_id: &str,
        client_secret: &str,
    ) -> anyhow::Result<GatewayResponse> {
        let body = serde_json::json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "subscriptions": [
                {"type": "CALLBACK", "topic": "/v1.0/im/bot/messages/get"}
            ],
        });

        let resp = client
            .post("https://api.dingtalk.com/v1.0/gateway/connections/open")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("DingTalk gateway registration failed ({status}): {err}");
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Channel for DingTalkChannel {
    fn name(&self) -> &'static str {
        "dingtalk"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            anyhow::bail!("dingtalk client_id and client_secret not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(stream_loop(
            Arc::clone(&self.base),
            self.client.clone(),
            self.config.client_id.clone(),
            self.config.client_secret.clone(),
            Arc::clone(&self.session_webhooks),
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("DingTalk channel started (stream mode)");
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

        let webhook_url = {
            let webhooks = self.session_webhooks.read().await;
            webhooks.get(&msg.chat_id).cloned()
        };
        let Some(webhook_url) = webhook_url else {
            // The session webhook only exists after the peer messaged us.
            return Err(ChannelError::temporary(format!(
                "no session webhook for chat {}",
                msg.chat_id
            )));
        };

        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": {"title": "PicoClaw", "text": msg.content},
        });

        let resp = self
            .client
            .post(&webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("dingtalk send: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::temporary(format!(
                "dingtalk webhook reply returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn stream_loop(
    base: Arc<BaseChannel>,
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    webhooks: Arc<RwLock<HashMap<String, String>>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_stream_once(&base, &client, &client_id, &client_secret, &webhooks, &shutdown)
            .await
        {
            Ok(()) => tracing::info!("DingTalk stream closed, reconnecting"),
            Err(e) => tracing::warn!("DingTalk stream error: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

async fn run_stream_once(
    base: &Arc<BaseChannel>,
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    webhooks: &Arc<RwLock<HashMap<String, String>>>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let gw = DingTalkChannel::register_connection(client, client_id, client_secret).await?;
    let ws_url = format!("{}?ticket={}", gw.endpoint, gw.ticket);

    let (ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (mut write, mut read) = ws.split();

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            f = read.next() => f,
        };

        let text = match frame {
            Some(Ok(WsMsg::Text(t))) => t,
            Some(Ok(WsMsg::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        let frame: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let message_id = frame
            .get("headers")
            .and_then(|h| h.get("messageId"))
            .and_then(|m| m.as_str())
            .unwrap_or("");

        match frame.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            // System pings keep the connection alive.
            "SYSTEM" => {
                let pong = ack_frame(message_id);
                if write.send(WsMsg::Text(pong.to_string())).await.is_err() {
                    return Ok(());
                }
            }
            "EVENT" | "CALLBACK" => {
                let ack = ack_frame(message_id);
                let _ = write.send(WsMsg::Text(ack.to_string())).await;

                let data_str = frame.get("data").and_then(|d| d.as_str()).unwrap_or("{}");
                if let Ok(data) = serde_json::from_str::<serde_json::Value>(data_str) {
                    handle_callback(base, webhooks, message_id, &data).await;
                }
            }
            _ => {}
        }
    }
}

fn ack_frame(message_id: &str) -> serde_json::Value {
    serde_json::json!({
        "code": 200,
        "headers": {"contentType": "application/json", "messageId": message_id},
        "message": "OK",
        "data": "",
    })
}

async fn handle_callback(
    base: &Arc<BaseChannel>,
    webhooks: &Arc<RwLock<HashMap<String, String>>>,
    frame_message_id: &str,
    data: &serde_json::Value,
) {
    let content = data
        .get("text")
        .and_then(|t| t.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .trim();
    if content.is_empty() {
        return;
    }

    let sender_id = data
        .get("senderStaffId")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    if sender_id.is_empty() {
        return;
    }
    let sender_nick = data
        .get("senderNick")
        .and_then(|s| s.as_str())
        .unwrap_or_default();

    let conversation_type = data
        .get("conversationType")
        .and_then(|c| c.as_str())
        .unwrap_or("1");
    // Private chats address the sender; group chats address the conversation.
    let (kind, chat_id) = if conversation_type == "1" {
        (PeerKind::Direct, sender_id.to_string())
    } else {
        (
            PeerKind::Group,
            data.get("conversationId")
                .and_then(|c| c.as_str())
                .unwrap_or(sender_id)
                .to_string(),
        )
    };

    if let Some(webhook) = data.get("sessionWebhook").and_then(|w| w.as_str()) {
        let mut map = webhooks.write().await;
        map.insert(chat_id.clone(), webhook.to_string());
    }

    let message_id = data
        .get("msgId")
        .and_then(|m| m.as_str())
        .unwrap_or(frame_message_id);

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());

    base.handle_message(
        Peer {
            kind,
            id: chat_id,
        },
        message_id,
        content,
        vec![],
        metadata,
        SenderInfo::new("dingtalk", sender_id).with_display_name(sender_nick),
    );
}
