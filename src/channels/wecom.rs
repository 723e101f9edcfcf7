//! WeCom smart-robot channel — encrypted callback webhook for events, the
//! robot webhook URL for replies.

use super::base::BaseChannel;
use super::wecom_crypto;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, SenderInfo};
use crate::config::WeComConfig;
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
use tokio_util::sync::CancellationToken;

pub struct WeComChannel {
    base: Arc<BaseChannel>,
    config: WeComConfig,
    client: reqwest::Client,
    shutdown: Mutex<Option<CancellationToken>>,
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

impl WeComChannel {
    pub fn new(config: WeComConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new("wecom", bus, config.allow_from.to_vec())),
            config,
            client: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for WeComChannel {
    fn name(&self) -> &'static str {
        "wecom"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.config.token.is_empty() || self.config.encoding_aes_key.is_empty() {
            anyhow::bail!("wecom token and encoding_aes_key not configured");
        }
        // Fail fast on a malformed key rather than on the first callback.
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
            "WeCom callback listening on http://{addr}{}",
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
                tracing::warn!("WeCom callback server error: {e}");
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
        if self.config.webhook_url.is_empty() {
            return Err(ChannelError::permanent(
                "wecom webhook_url not configured for replies",
            ));
        }

        let body = serde_json::json!({
            "msgtype": "text",
            "text": {"content": msg.content},
        });

        let resp = self
            .client
            .post(&self.config.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::temporary(format!("wecom send: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChannelError::temporary(format!(
                "wecom webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// GET verification handshake: echo the decrypted `echostr`.
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
            tracing::warn!("WeCom echostr decrypt failed: {e}");
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
        tracing::warn!("WeCom callback signature verification failed");
        return StatusCode::FORBIDDEN;
    }

    let plain = match wecom_crypto::decrypt(&state.encoding_aes_key, &encrypted) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("WeCom callback decrypt failed: {e}");
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

    base.handle_message(
        Peer::direct(from_user.clone()),
        &message_id,
        &content,
        vec![],
        metadata,
        SenderInfo::new("wecom", from_user),
    );
}
