//! Discord channel — Gateway WebSocket for events, REST for replies.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::DiscordConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const API_BASE: &str = "https://discord.com/api/v10";
const RECONNECT_DELAY_SECS: u64 = 5;

// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 1 | (1 << 9) | (1 << 12) | (1 << 15);

pub struct DiscordChannel {
    base: Arc<BaseChannel>,
    config: DiscordConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new(
                "discord",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            client: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.token.is_empty() {
            anyhow::bail!("discord token not configured");
        }

        let token = CancellationToken::new();
        tokio::spawn(gateway_loop(
            Arc::clone(&self.base),
            self.config.token.clone(),
            self.config.mention_only,
            token.clone(),
        ));

        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.base.set_running(true);
        tracing::info!("Discord channel started (gateway)");
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

        let mut body = serde_json::json!({ "content": msg.content });
        if let Some(reply_to) = &msg.reply_to_message_id {
            body["message_reference"] = serde_json::json!({ "message_id": reply_to });
        }

        let resp = self
            .client
            .post(format!("{API_BASE}/channels/{}/messages", msg.chat_id))
            .header("Authorization", format!("Bot {}", self.config.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("discord send: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            403 | 404 => Err(ChannelError::permanent(format!(
                "discord channel {} unavailable ({})",
                msg.chat_id,
                resp.status()
            ))),
            _ => Err(ChannelError::temporary(format!(
                "discord send returned {}",
                resp.status()
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn gateway_loop(
    base: Arc<BaseChannel>,
    bot_token: String,
    mention_only: bool,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_gateway_once(&base, &bot_token, mention_only, &shutdown).await {
            Ok(()) => tracing::info!("Discord gateway closed, reconnecting"),
            Err(e) => tracing::warn!("Discord gateway error: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
        }
    }
}

async fn run_gateway_once(
    base: &Arc<BaseChannel>,
    bot_token: &str,
    mention_only: bool,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(GATEWAY_URL).await?;
    let (mut write, mut read) = ws.split();

    let mut bot_user_id = String::new();
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
            // HELLO: adopt the server heartbeat interval and identify.
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
                    "d": {
                        "token": bot_token,
                        "intents": GATEWAY_INTENTS,
                        "properties": {"os": "linux", "browser": "picoclaw", "device": "picoclaw"},
                    },
                });
                write.send(WsMsg::Text(identify.to_string())).await?;
            }
            // RECONNECT / INVALID SESSION: drop and redial.
            Some(7) | Some(9) => return Ok(()),
            Some(0) => match payload.get("t").and_then(|t| t.as_str()) {
                Some("READY") => {
                    bot_user_id = payload
                        .get("d")
                        .and_then(|d| d.get("user"))
                        .and_then(|u| u.get("id"))
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    tracing::info!("Discord gateway ready (bot id {bot_user_id})");
                }
                Some("MESSAGE_CREATE") => {
                    if let Some(data) = payload.get("d") {
                        handle_message_create(base, data, &bot_user_id, mention_only);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
}

fn handle_message_create(
    base: &BaseChannel,
    data: &serde_json::Value,
    bot_user_id: &str,
    mention_only: bool,
) {
    let author = data.get("author");
    let author_id = author
        .and_then(|a| a.get("id"))
        .and_then(|i| i.as_str())
        .unwrap_or_default();
    if author_id.is_empty() || author_id == bot_user_id {
        return;
    }
    if author
        .and_then(|a| a.get("bot"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return;
    }

    let mut content = data
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let channel_id = data
        .get("channel_id")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message_id = data
        .get("id")
        .and_then(|i| i.as_str())
        .unwrap_or_default();

    // guild_id is absent for DMs.
    let is_dm = data.get("guild_id").is_none();
    if !is_dm && mention_only {
        let mention = format!("<@{bot_user_id}>");
        let mention_nick = format!("<@!{bot_user_id}>");
        if !content.contains(&mention) && !content.contains(&mention_nick) {
            return;
        }
        content = content
            .replace(&mention_nick, "")
            .replace(&mention, "")
            .trim()
            .to_string();
    }

    let kind = if is_dm {
        PeerKind::Direct
    } else {
        PeerKind::Group
    };
    let username = author
        .and_then(|a| a.get("username"))
        .and_then(|u| u.as_str())
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert("peer_id".into(), channel_id.to_string());

    base.handle_message(
        Peer {
            kind,
            id: channel_id.to_string(),
        },
        message_id,
        &content,
        vec![],
        metadata,
        SenderInfo::new("discord", author_id).with_display_name(username),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(mention_only: bool) -> (Arc<MessageBus>, DiscordChannel) {
        let bus = Arc::new(MessageBus::new());
        let config = DiscordConfig {
            enabled: true,
            token: "bot-token".into(),
            mention_only,
            allow_from: vec![].into(),
        };
        (bus.clone(), DiscordChannel::new(config, bus))
    }

    #[tokio::test]
    async fn dm_message_is_direct() {
        let (bus, ch) = channel(false);
        let data = serde_json::json!({
            "id": "m1",
            "content": "hi",
            "channel_id": "c1",
            "author": {"id": "u1", "username": "alice"},
        });
        handle_message_create(&ch.base, &data, "bot1", false);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer.kind, PeerKind::Direct);
        assert_eq!(msg.sender.canonical_id, "discord:u1");
    }

    #[tokio::test]
    async fn guild_message_without_mention_is_skipped_when_mention_only() {
        let (bus, ch) = channel(true);
        let data = serde_json::json!({
            "id": "m2",
            "content": "no mention here",
            "channel_id": "c2",
            "guild_id": "g1",
            "author": {"id": "u2", "username": "bob"},
        });
        handle_message_create(&ch.base, &data, "bot1", true);
        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn guild_mention_is_stripped() {
        let (bus, ch) = channel(true);
        let data = serde_json::json!({
            "id": "m3",
            "content": "<@bot1> do the thing",
            "channel_id": "c3",
            "guild_id": "g1",
            "author": {"id": "u3", "username": "carol"},
        });
        handle_message_create(&ch.base, &data, "bot1", true);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.content, "do the thing");
        assert_eq!(msg.peer.kind, PeerKind::Group);
    }

    #[tokio::test]
    async fn own_and_bot_messages_are_ignored() {
        let (bus, ch) = channel(false);
        let own = serde_json::json!({
            "id": "m4",
            "content": "echo",
            "channel_id": "c4",
            "author": {"id": "bot1", "username": "me"},
        });
        handle_message_create(&ch.base, &own, "bot1", false);

        let other_bot = serde_json::json!({
            "id": "m5",
            "content": "beep",
            "channel_id": "c4",
            "author": {"id": "u9", "username": "robo", "bot": true},
        });
        handle_message_create(&ch.base, &other_bot, "bot1", false);

        let empty =
            tokio::time::timeout(std::time::Duration::from_millis(50), bus.next_inbound()).await;
        assert!(empty.is_err());
    }
}
