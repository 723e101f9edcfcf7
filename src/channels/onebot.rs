//! OneBot v11 channel — client WebSocket to a OneBot implementation
//! (go-cqhttp, Lagrange, NapCat…). Group messages only trigger when prefixed
//! with one of `group_trigger_prefix` or when the bot is @-mentioned.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::OneBotConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

pub struct OneBotChannel {
    base: Arc<BaseChannel>,
    config: OneBotConfig,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl OneBotChannel {
    pub fn new(config: OneBotConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("onebot", bus, config.allow_from.to_vec())),
            config,
            outgoing: Arc::new(Mutex::new(None)),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for OneBotChannel {
    fn name(&self) -> &'static str {
        "onebot"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.ws_url.is_empty() {
            anyhow::bail!("onebot ws_url not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(ws_loop(
            Arc::clone(&self.base),
            self.config.clone(),
            Arc::clone(&self.outgoing),
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("OneBot channel started ({})", self.config.ws_url);
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
        *self
            .outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.base.is_running() {
            return Err(ChannelError::NotRunning);
        }

        // Inbound peers are encoded as "group:<id>" / "private:<id>".
        let action = match msg.chat_id.split_once(':') {
            Some(("group", id)) => serde_json::json!({
                "action": "send_group_msg",
                "params": {"group_id": id.parse::<i64>().unwrap_or_default(), "message": msg.content},
            }),
            Some(("private", id)) => serde_json::json!({
                "action": "send_private_msg",
                "params": {"user_id": id.parse::<i64>().unwrap_or_default(), "message": msg.content},
            }),
            _ => {
                return Err(ChannelError::permanent(format!(
                    "malformed onebot chat id {}",
                    msg.chat_id
                )))
            }
        };

        let sender = self
            .outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match sender {
            Some(tx) if tx.send(action.to_string()).is_ok() => Ok(()),
            _ => Err(ChannelError::temporary("onebot socket not connected")),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn ws_loop(
    base: Arc<BaseChannel>,
    config: OneBotConfig,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: CancellationToken,
) {
    let reconnect = std::time::Duration::from_secs(config.reconnect_interval.max(1));

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_ws_once(&base, &config, &outgoing, &shutdown).await {
            Ok(()) => tracing::info!("OneBot socket closed, reconnecting"),
            Err(e) => tracing::warn!("OneBot socket error: {e}"),
        }

        *outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(reconnect) => {}
        }
    }
}

async fn run_ws_once(
    base: &Arc<BaseChannel>,
    config: &OneBotConfig,
    outgoing: &Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut request = config.ws_url.as_str().into_client_request()?;
    if !config.access_token.is_empty() {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.access_token).parse()?,
        );
    }

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *outgoing
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            Some(out) = rx.recv() => {
                write.send(WsMsg::Text(out)).await?;
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
        handle_event(base, &config.group_trigger_prefix, &event);
    }
}

fn handle_event(base: &BaseChannel, group_prefixes: &[String], event: &serde_json::Value) {
    if event.get("post_type").and_then(|p| p.as_str()) != Some("message") {
        return;
    }

    let user_id = event
        .get("user_id")
        .and_then(serde_json::Value::as_i64)
        .map(|i| i.to_string())
        .unwrap_or_default();
    if user_id.is_empty() {
        return;
    }

    let self_id = event
        .get("self_id")
        .and_then(serde_json::Value::as_i64)
        .map(|i| i.to_string())
        .unwrap_or_default();
    let mut content = event
        .get("raw_message")
        .or_else(|| event.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    let message_id = event
        .get("message_id")
        .map(|m| m.to_string().trim_matches('"').to_string())
        .unwrap_or_default();

    let (kind, chat_id) = match event.get("message_type").and_then(|m| m.as_str()) {
        Some("private") => (PeerKind::Direct, format!("private:{user_id}")),
        Some("group") => {
            let group_id = event
                .get("group_id")
                .and_then(serde_json::Value::as_i64)
                .map(|i| i.to_string())
                .unwrap_or_default();

            // Group chats only trigger on an @-mention or a configured prefix.
            let at_marker = format!("[CQ:at,qq={self_id}]");
            if content.contains(&at_marker) {
                content = content.replace(&at_marker, "").trim().to_string();
            } else if let Some(prefix) =
                group_prefixes.iter().find(|p| content.starts_with(p.as_str()))
            {
                content = content[prefix.len()..].trim().to_string();
            } else {
                return;
            }
            (PeerKind::Group, format!("group:{group_id}"))
        }
        _ => return,
    };

    let nickname = event
        .get("sender")
        .and_then(|s| s.get("nickname"))
        .and_then(|n| n.as_str())
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), chat_id.clone());

    base.handle_message(
        Peer { kind, id: chat_id },
        &message_id,
        &content,
        vec![],
        metadata,
        SenderInfo::new("onebot", user_id).with_display_name(nickname),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(prefixes: Vec<String>) -> (Arc<MessageBus>, OneBotChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = OneBotConfig {
            enabled: true,
            ws_url: "ws://127.0.0.1:6700".into(),
            access_token: String::new(),
            reconnect_interval: 5,
            group_trigger_prefix: prefixes.into(),
            allow_from: vec![].into(),
        };
        (bus.clone(), OneBotChannel::new(config, bus))
    }

    #[tokio::test]
    async fn private_message_uses_private_chat_id() {
        let (bus, ch) = channel(vec![]);
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "private",
            "message_id": 77,
            "user_id": 12345,
            "raw_message": "hello",
            "sender": {"nickname": "alice"},
        });
        handle_event(&ch.base, &[], &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("private:12345"));
        assert_eq!(msg.sender.canonical_id, "onebot:12345");
    }

    #[tokio::test]
    async fn group_message_without_trigger_is_ignored() {
        let (bus, ch) = channel(vec!["!ai".into()]);
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "message_id": 78,
            "user_id": 1,
            "group_id": 999,
            "raw_message": "just chatting",
        });
        handle_event(&ch.base, &["!ai".to_string()], &event);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn group_prefix_is_stripped() {
        let (bus, ch) = channel(vec!["!ai".into()]);
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "message_id": 79,
            "user_id": 1,
            "group_id": 999,
            "raw_message": "!ai what is rust",
        });
        handle_event(&ch.base, &["!ai".to_string()], &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.content, "what is rust");
        assert_eq!(msg.peer, Peer::group("group:999"));
    }

    #[tokio::test]
    async fn group_at_mention_triggers() {
        let (bus, ch) = channel(vec![]);
        let event = serde_json::json!({
            "post_type": "message",
            "message_type": "group",
            "message_id": 80,
            "self_id": 555,
            "user_id": 1,
            "group_id": 999,
            "raw_message": "[CQ:at,qq=555] ping",
        });
        handle_event(&ch.base, &[], &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.content, "ping");
    }

    #[tokio::test]
    async fn send_with_malformed_chat_id_is_permanent() {
        let (_bus, ch) = channel(vec![]);
        ch.base.set_running(true);
        let err = ch
            .send(&OutboundMessage {
                channel: "onebot".into(),
                chat_id: "12345".into(),
                content: "x".into(),
                reply_to_message_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Permanent(_)));
    }

    #[tokio::test]
    async fn send_while_disconnected_is_temporary() {
        let (_bus, ch) = channel(vec![]);
        ch.base.set_running(true);
        let err = ch
            .send(&OutboundMessage {
                channel: "onebot".into(),
                chat_id: "private:1".into(),
                content: "x".into(),
                reply_to_message_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Temporary(_)));
    }
}
