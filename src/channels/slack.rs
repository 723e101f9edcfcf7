//! Slack channel — Socket Mode WebSocket for events, Web API for replies.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::SlackConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY_SECS: u64 = 5;

pub struct SlackChannel {
    base: Arc<BaseChannel>,
    config: SlackConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl SlackChannel {
    pub fn new(config: SlackConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("slack", bus, config.allow_from.to_vec())),
            config,
            client: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.bot_token.is_empty() || self.config.app_token.is_empty() {
            anyhow::bail!("slack bot_token and app_token not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(socket_mode_loop(
            Arc::clone(&self.base),
            self.client.clone(),
            self.config.app_token.clone(),
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("Slack channel started (Socket Mode)");
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
            "channel": msg.chat_id,
            "text": msg.content,
        });
        if let Some(ts) = &msg.reply_to_message_id {
            body["thread_ts"] = serde_json::json!(ts);
        }

        let resp = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.config.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("slack send: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::temporary(format!(
                "slack chat.postMessage returned {}",
                resp.status()
            )));
        }

        // Slack returns 200 for most app-level errors; check the "ok" field.
        let parsed: serde_json::Value = resp.json().await.unwrap_or_default();
        if parsed.get("ok") == Some(&serde_json::Value::Bool(false)) {
            let err = parsed
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            return match err {
                "channel_not_found" | "is_archived" | "msg_too_long" => Err(
                    ChannelError::permanent(format!("slack chat.postMessage: {err}")),
                ),
                _ => Err(ChannelError::temporary(format!(
                    "slack chat.postMessage: {err}"
                ))),
            };
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// Open a Socket Mode connection and pump events, reconnecting until shutdown.
async fn socket_mode_loop(
    base: Arc<BaseChannel>,
    client: reqwest::Client,
    app_token: String,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_socket_once(&base, &client, &app_token, &shutdown).await {
            Ok(()) => tracing::info!("Slack socket closed, reconnecting"),
            Err(e) => tracing::warn!("Slack socket error: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

async fn run_socket_once(
    base: &Arc<BaseChannel>,
    client: &reqwest::Client,
    app_token: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let resp: serde_json::Value = client
        .post("https://slack.com/api/apps.connections.open")
        .bearer_auth(app_token)
        .send()
        .await?
        .json()
        .await?;

    if resp.get("ok") != Some(&serde_json::Value::Bool(true)) {
        anyhow::bail!(
            "apps.connections.open failed: {}",
            resp.get("error").and_then(|e| e.as_str()).unwrap_or("?")
        );
    }
    let ws_url = resp
        .get("url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| anyhow::anyhow!("apps.connections.open returned no url"))?;

    let (ws, _) = tokio_tungstenite::connect_async(ws_url).await?;
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

        let envelope: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // Every events_api envelope must be acked or Slack redelivers.
        if let Some(envelope_id) = envelope.get("envelope_id").and_then(|e| e.as_str()) {
            let ack = serde_json::json!({ "envelope_id": envelope_id });
            write.send(WsMsg::Text(ack.to_string())).await?;
        }

        match envelope.get("type").and_then(|t| t.as_str()) {
            Some("events_api") => {
                if let Some(event) = envelope
                    .get("payload")
                    .and_then(|p| p.get("event"))
                {
                    handle_event(base, event);
                }
            }
            Some("disconnect") => return Ok(()),
            _ => {}
        }
    }
}

fn handle_event(base: &BaseChannel, event: &serde_json::Value) {
    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if event_type != "message" && event_type != "app_mention" {
        return;
    }
    // Ignore bot echoes and edits.
    if event.get("bot_id").is_some() || event.get("subtype").is_some() {
        return;
    }

    let Some(user) = event.get("user").and_then(|u| u.as_str()) else {
        return;
    };
    let Some(text) = event.get("text").and_then(|t| t.as_str()) else {
        return;
    };
    let channel_id = event
        .get("channel")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let ts = event.get("ts").and_then(|t| t.as_str()).unwrap_or_default();

    let channel_type = event
        .get("channel_type")
        .and_then(|c| c.as_str())
        .unwrap_or("channel");
    let kind = if channel_type == "im" {
        PeerKind::Direct
    } else {
        PeerKind::Group
    };

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), channel_id.to_string());
    metadata.insert("ts".into(), ts.to_string());

    base.handle_message(
        Peer {
            kind,
            id: channel_id.to_string(),
        },
        &format!("slack_{channel_id}_{ts}"),
        text,
        vec![],
        metadata,
        SenderInfo::new("slack", user),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Arc<MessageBus>, SlackChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = SlackConfig {
            enabled: true,
            bot_token: "xoxb-fake".into(),
            app_token: "xapp-fake".into(),
            allow_from: vec![].into(),
        };
        (bus.clone(), SlackChannel::new(config, bus))
    }

    #[tokio::test]
    async fn start_without_tokens_fails() {
        let bus = Arc::new(MessageBus::new());
        let ch = SlackChannel::new(SlackConfig::default(), bus);
        assert!(ch.start().await.is_err());
        assert!(!ch.is_running());
    }

    #[tokio::test]
    async fn dm_event_maps_to_direct_peer() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "user": "U111",
            "text": "hi",
            "channel": "D222",
            "channel_type": "im",
            "ts": "1700000000.000100",
        });
        handle_event(&ch.base, &event);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer.kind, PeerKind::Direct);
        assert_eq!(msg.sender.canonical_id, "slack:U111");
        assert_eq!(msg.message_id, "slack_D222_1700000000.000100");
    }

    #[tokio::test]
    async fn bot_messages_are_ignored() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "user": "U111",
            "bot_id": "B999",
            "text": "echo",
            "channel": "C1",
            "ts": "1.2",
        });
        handle_event(&ch.base, &event);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn deterministic_ids_deduplicate_redelivery() {
        let (bus, ch) = channel();
        let event = serde_json::json!({
            "type": "message",
            "user": "U111",
            "text": "hi",
            "channel": "C1",
            "channel_type": "channel",
            "ts": "9.9",
        });
        handle_event(&ch.base, &event);
        handle_event(&ch.base, &event);
        let _ = bus.next_inbound().await;
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }
}
