//! Telegram channel — long-polls the Bot API for updates.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::TelegramConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct TelegramChannel {
    base: Arc<BaseChannel>,
    config: TelegramConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, bus: Arc<MessageBus>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !config.proxy.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(&config.proxy)?);
        }
        Ok(Self {
            base: Arc::new(BaseChannel::new(
                "telegram",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            client: builder.build()?,
            shutdown: Mutex::new(None),
        })
    }

    fn api_url(token: &str, method: &str) -> String {
        format!("https://api.telegram.org/bot{token}/{method}")
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.token.is_empty() {
            anyhow::bail!("telegram token not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(poll_updates(
            Arc::clone(&self.base),
            self.client.clone(),
            self.config.token.clone(),
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("Telegram channel started (long polling)");
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

        let mut body = serde_json::json!({
            "chat_id": msg.chat_id,
            "text": msg.content,
        });
        if let Some(reply_to) = &msg.reply_to_message_id {
            body["reply_to_message_id"] = serde_json::json!(reply_to);
        }

        let resp = self
            .client
            .post(Self::api_url(&self.config.token, "sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("telegram send: {e}")))?;

        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(ChannelError::permanent(format!(
                "telegram rejected message for chat {}",
                msg.chat_id
            )));
        }
        if !resp.status().is_success() {
            return Err(ChannelError::temporary(format!(
                "telegram sendMessage returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn poll_updates(
    base: Arc<BaseChannel>,
    client: reqwest::Client,
    token: String,
    shutdown: CancellationToken,
) {
    let mut offset: i64 = 0;
    let url = TelegramChannel::api_url(&token, "getUpdates");

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let body = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message"],
        });

        let resp = tokio::select! {
            () = shutdown.cancelled() => return,
            r = client.post(&url).json(&body).send() => r,
        };

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram poll error: {e}");
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                }
            }
        };

        let data: serde_json::Value = match resp.json().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Telegram parse error: {e}");
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                }
            }
        };

        let Some(results) = data.get("result").and_then(serde_json::Value::as_array) else {
            continue;
        };

        for update in results {
            if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                offset = uid + 1;
            }
            handle_update(&base, update);
        }
    }
}

fn handle_update(base: &BaseChannel, update: &serde_json::Value) {
    let Some(message) = update.get("message") else {
        return;
    };
    let Some(text) = message.get("text").and_then(serde_json::Value::as_str) else {
        return;
    };

    let from = message.get("from");
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    if user_id.is_empty() {
        return;
    }
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();

    let chat = message.get("chat");
    let chat_id = chat
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let chat_type = chat
        .and_then(|c| c.get("type"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("private");
    let kind = if chat_type == "private" {
        PeerKind::Direct
    } else {
        PeerKind::Group
    };

    let message_id = message
        .get("message_id")
        .and_then(serde_json::Value::as_i64)
        .map(|id| format!("telegram_{chat_id}_{id}"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());
    if !username.is_empty() {
        metadata.insert("user_name".into(), username.to_string());
    }

    let sender = SenderInfo::new("telegram", user_id).with_display_name(username);

    base.handle_message(
        Peer { kind, id: chat_id },
        &message_id,
        text,
        vec![],
        metadata,
        sender,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(allow_from: Vec<String>) -> (Arc<MessageBus>, TelegramChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = TelegramConfig {
            enabled: true,
            token: "123:ABC".into(),
            proxy: String::new(),
            allow_from: allow_from.into(),
        };
        let ch = TelegramChannel::new(config, bus.clone()).unwrap();
        (bus, ch)
    }

    #[test]
    fn api_url_embeds_token_and_method() {
        assert_eq!(
            TelegramChannel::api_url("123:ABC", "getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[tokio::test]
    async fn start_without_token_fails() {
        let bus = Arc::new(MessageBus::new());
        let ch = TelegramChannel::new(TelegramConfig::default(), bus).unwrap();
        assert!(ch.start().await.is_err());
        assert!(!ch.is_running());
    }

    #[tokio::test]
    async fn send_while_stopped_is_not_running() {
        let (_bus, ch) = channel(vec![]);
        let err = ch
            .send(&OutboundMessage {
                channel: "telegram".into(),
                chat_id: "1".into(),
                content: "hi".into(),
                reply_to_message_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotRunning));
    }

    #[tokio::test]
    async fn private_update_becomes_direct_inbound() {
        let (bus, ch) = channel(vec![]);
        let update = serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 42,
                "text": "hello",
                "from": {"id": 1001, "username": "alice"},
                "chat": {"id": 1001, "type": "private"},
            }
        });
        handle_update(&ch.base, &update);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer.kind, PeerKind::Direct);
        assert_eq!(msg.peer.id, "1001");
        assert_eq!(msg.sender.canonical_id, "telegram:1001");
        assert_eq!(msg.sender.display_name.as_deref(), Some("alice"));
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn group_update_becomes_group_inbound() {
        let (bus, ch) = channel(vec![]);
        let update = serde_json::json!({
            "message": {
                "message_id": 1,
                "text": "ping",
                "from": {"id": 5, "username": "bob"},
                "chat": {"id": -100123, "type": "supergroup"},
            }
        });
        handle_update(&ch.base, &update);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer.kind, PeerKind::Group);
        assert_eq!(msg.peer.id, "-100123");
        assert_eq!(msg.metadata.get("peer_kind").map(String::as_str), Some("group"));
    }

    #[tokio::test]
    async fn update_without_sender_id_is_ignored() {
        let (bus, ch) = channel(vec![]);
        let update = serde_json::json!({
            "message": {
                "message_id": 1,
                "text": "ping",
                "chat": {"id": 9, "type": "private"},
            }
        });
        handle_update(&ch.base, &update);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }
}
