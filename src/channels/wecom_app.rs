//! WeCom self-built app channel — encrypted callback webhook for events,
//! the corp message API (access-token based) for replies.

use super::base::BaseChannel;
use super::wecom_crypto;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, SenderInfo};
use crate::config::WeComAppConfig;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const API_BASE: &str = "https://qyapi.weixin.qq.com/cgi-bin";

pub struct WeComAppChannel {
    base: Arc<BaseChannel>,
    config: WeComAppConfig,
    client: reqwest::Client,
    access_token: tokio::sync::Mutex<Option<CachedToken>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
    expires_in: u64,
}

#[derive(Clone)]
struct CallbackState {
    base: Arc<BaseChannel>,
    token: String,
    encoding_aes_key: String,
}

#[derive(serde::Deserialize)]
struct CallbackQuery {
    msg_signature: String,
    timestamp: String,
    nonce: String,
    #[serde(default)]
    echostr: Option<String>,
}

impl WeComAppChannel {
    pub fn new(config: WeComAppConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new(
                "wecom_app",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            client: reqwest::Client::new(),
            access_token: tokio::sync::Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Fetch (or reuse) the corp access token. Tokens last two hours; refresh
    /// a minute early.
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.access_token.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed().as_secs() + 60 < entry.expires_in {
                return Ok(entry.token.clone());
            }
        }

        let resp: serde_json::Value = self
            .client
            .get(format!(
                "{API_BASE}/gettoken?corpid={}&corpsecret={}",
                self.config.corp_id, self.config.corp_secret
            ))
            .send()
            .await?
            .json()
            .await?;

        if resp.get("errcode").and_then(serde_json::Value::as_i64) != Some(0) {
            anyhow::bail!(
                "wecom gettoken failed: {}",
                resp.get("errmsg").and_then(|m| m.as_str()).unwrap_or("?")
            );
        }
        let token = resp
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("wecom gettoken returned no access_token"))?
            .to_string();
        let expires_in = resp
            .get("expires_in")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(7200);

        *cached = Some(CachedToken {
            token: token.clone(),
            fetched_at: Instant::now(),
            expires_in,
        });
        Ok(token)
    }
}

#[async_trait]
impl Channel for WeComAppChannel {
    fn name(&self) -> &'static str {
        "wecom_app"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.corp_id.is_empty()
            || self.config.corp_secret.is_empty()
            || self.config.token.is_empty()
            || self.config.encoding_aes_key.is_empty()
        {
            anyhow::bail!("wecom_app corp_id, corp_secret, token and encoding_aes_key required");
        }
        wecom_crypto::decode_aes_key(&self.config.encoding_aes_key)?;

        let state = CallbackState {
            base: Arc::clone(&self.base),
            token: self.config.token.clone(),
            encoding_aes_key: self.config.encoding_aes_key.clone(),
        };
        let app = Router::new()
            .route(&self.config.webhook_path, get(handle_verify))
            .route(&self.config.webhook_path, post(handle_callback))
            .with_state(state);

        let addr = format!("{}:{}", self.config.webhook_host, self.config.webhook_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            "WeCom app callback listening on http://{addr}{}",
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
                tracing::warn!("WeCom app callback server error: {e}");
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

        let token = self
            .access_token()
            .await
            .map_err(|e| ChannelError::temporary(e.to_string()))?;

        let body = serde_json::json!({
            "touser": msg.chat_id,
            "msgtype": "text",
            "agentid": self.config.agent_id,
            "text": {"content": msg.content},
        });

        let resp: serde_json::Value = self
            .client
            .post(format!("{API_BASE}/message/send?access_token={token}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("wecom_app send: {e}")))?
            .json()
            .await
            .map_err(|e| ChannelError::temporary(format!("wecom_app send decode: {e}")))?;

        match resp.get("errcode").and_then(serde_json::Value::as_i64) {
            Some(0) => Ok(()),
            // 81013: user not found in the app's visible range.
            Some(81013) | Some(60111) => Err(ChannelError::permanent(format!(
                "wecom_app unknown recipient {}",
                msg.chat_id
            ))),
            other => Err(ChannelError::temporary(format!(
                "wecom_app send failed (errcode {other:?}): {}",
                resp.get("errmsg").and_then(|m| m.as_str()).unwrap_or("?")
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn handle_verify(
    State(state): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    let Some(echostr) = query.echostr.as_deref() else {
        return (StatusCode::BAD_REQUEST, "missing echostr".to_string());
    };
    if !wecom_crypto::verify_signature(
        &state.token,
        &query.timestamp,
        &query.nonce,
        echostr,
        &query.msg_signature,
    ) {
        return (StatusCode::FORBIDDEN, "signature mismatch".to_string());
    }
    match wecom_crypto::decrypt(&state.encoding_aes_key, echostr) {
        Ok(plain) => (StatusCode::OK, String::from_utf8_lossy(&plain).into_owned()),
        Err(e) => {
            tracing::warn!("WeCom app echostr decrypt failed: {e}");
            (StatusCode::BAD_REQUEST, "decrypt failed".to_string())
        }
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> StatusCode {
    let Some(encrypted) = wecom_crypto::extract_xml_field(&body, "Encrypt") else {
        return StatusCode::BAD_REQUEST;
    };
    if !wecom_crypto::verify_signature(
        &state.token,
        &query.timestamp,
        &query.nonce,
        &encrypted,
        &query.msg_signature,
    ) {
        tracing::warn!("WeCom app callback signature verification failed");
        return StatusCode::FORBIDDEN;
    }

    let plain = match wecom_crypto::decrypt(&state.encoding_aes_key, &encrypted) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("WeCom app callback decrypt failed: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    handle_plain_message(&state.base, &String::from_utf8_lossy(&plain));
    StatusCode::OK
}

fn handle_plain_message(base: &BaseChannel, xml: &str) {
    if wecom_crypto::extract_xml_field(xml, "MsgType").as_deref() != Some("text") {
        return;
    }
    let Some(from_user) = wecom_crypto::extract_xml_field(xml, "FromUserName") else {
        return;
    };
    let content = wecom_crypto::extract_xml_field(xml, "Content").unwrap_or_default();
    let message_id = wecom_crypto::extract_xml_field(xml, "MsgId")
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), "direct".into());
    metadata.insert("peer_id".into(), from_user.clone());
    if let Some(agent_id) = wecom_crypto::extract_xml_field(xml, "AgentID") {
        metadata.insert("agent_id".into(), agent_id);
    }

    base.handle_message(
        Peer::direct(from_user.clone()),
        &message_id,
        &content,
        vec![],
        metadata,
        SenderInfo::new("wecom_app", from_user),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_callback_publishes_inbound() {
        let bus = Arc::new(MessageBus::new());
        let ch = WeComAppChannel::new(WeComAppConfig::default(), bus.clone());
        let xml = "<xml><MsgType>text</MsgType>\
                   <FromUserName>lisi</FromUserName>\
                   <Content>status?</Content>\
                   <MsgId>55</MsgId>\
                   <AgentID>1000002</AgentID></xml>";
        handle_plain_message(&ch.base, xml);
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("lisi"));
        assert_eq!(msg.metadata.get("agent_id").map(String::as_str), Some("1000002"));
    }

    #[tokio::test]
    async fn start_requires_all_credentials() {
        let bus = Arc::new(MessageBus::new());
        let ch = WeComAppChannel::new(WeComAppConfig::default(), bus);
        assert!(ch.start().await.is_err());
        assert!(!ch.is_running());
    }
}
