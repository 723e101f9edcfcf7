//! MaixCam channel — TCP listener speaking a line-delimited JSON protocol to
//! Sipeed camera devices. Each connected device announces a `device_id`;
//! replies are written back over the same socket.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, SenderInfo};
use crate::config::MaixCamConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type DeviceWriters = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

pub struct MaixCamChannel {
    base: Arc<BaseChannel>,
    config: MaixCamConfig,
    writers: DeviceWriters,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl MaixCamChannel {
    pub fn new(config: MaixCamConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(BaseChannel::new(
                "maixcam",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            writers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for MaixCamChannel {
    fn name(&self) -> &'static str {
        "maixcam"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("MaixCam channel listening on {addr}");

        let token = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.base),
            Arc::clone(&self.writers),
            token.clone(),
        ));

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
        self.writers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.base.is_running() {
            return Err(ChannelError::NotRunning);
        }

        let frame = serde_json::json!({
            "type": "reply",
            "content": msg.content,
        })
        .to_string();

        let writer = self
            .writers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&msg.chat_id)
            .cloned();
        match writer {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(ChannelError::temporary(format!(
                "maixcam device {} not connected",
                msg.chat_id
            ))),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

async fn accept_loop(
    listener: TcpListener,
    base: Arc<BaseChannel>,
    writers: DeviceWriters,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            a = listener.accept() => a,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("MaixCam accept error: {e}");
                continue;
            }
        };

        tracing::debug!("MaixCam device connected from {peer_addr}");
        tokio::spawn(serve_device(
            stream,
            Arc::clone(&base),
            Arc::clone(&writers),
            shutdown.clone(),
        ));
    }
}

async fn serve_device(
    stream: tokio::net::TcpStream,
    base: Arc<BaseChannel>,
    writers: DeviceWriters,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut device_id: Option<String> = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(reply) = rx.recv() => {
                if write_half.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) | Err(_) => break,
                };
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                handle_frame(&base, &writers, &tx, &mut device_id, &frame);
            }
        }
    }

    if let Some(id) = device_id {
        writers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
        tracing::debug!("MaixCam device {id} disconnected");
    }
}

fn handle_frame(
    base: &BaseChannel,
    writers: &DeviceWriters,
    tx: &mpsc::UnboundedSender<String>,
    device_id: &mut Option<String>,
    frame: &serde_json::Value,
) {
    let frame_type = frame.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let id = frame
        .get("device_id")
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    if id.is_empty() {
        return;
    }

    // Any frame registers the device for replies.
    if device_id.as_deref() != Some(id) {
        *device_id = Some(id.to_string());
        writers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_string(), tx.clone());
    }

    if frame_type != "message" {
        return;
    }
    let content = frame
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let message_id = frame
        .get("message_id")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut metadata = HashMap::new();
    metadata.insert("peer_kind".into(), "direct".into());
    metadata.insert("peer_id".into(), id.to_string());

    base.handle_message(
        Peer::direct(id),
        &message_id,
        content,
        vec![],
        metadata,
        SenderInfo::new("maixcam", id),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Arc<MessageBus>, MaixCamChannel) {
        let bus = Arc::new(MessageBus::new());
        (bus.clone(), MaixCamChannel::new(MaixCamConfig::default(), bus))
    }

    #[tokio::test]
    async fn message_frame_registers_device_and_publishes() {
        let (bus, ch) = channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut device_id = None;
        let frame = serde_json::json!({
            "type": "message",
            "device_id": "cam-01",
            "message_id": "m1",
            "content": "detected person",
        });
        handle_frame(&ch.base, &ch.writers, &tx, &mut device_id, &frame);

        assert_eq!(device_id.as_deref(), Some("cam-01"));
        let msg = bus.next_inbound().await;
        assert_eq!(msg.peer, Peer::direct("cam-01"));
        assert_eq!(msg.content, "detected person");
        assert!(ch
            .writers
            .lock()
            .unwrap()
            .contains_key("cam-01"));
    }

    #[tokio::test]
    async fn send_routes_to_registered_device() {
        let (_bus, ch) = channel();
        ch.base.set_running(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.writers.lock().unwrap().insert("cam-01".into(), tx);

        ch.send(&OutboundMessage {
            channel: "maixcam".into(),
            chat_id: "cam-01".into(),
            content: "take photo".into(),
            reply_to_message_id: None,
        })
        .await
        .unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "reply");
        assert_eq!(frame["content"], "take photo");
    }

    #[tokio::test]
    async fn send_to_unknown_device_is_temporary() {
        let (_bus, ch) = channel();
        ch.base.set_running(true);
        let err = ch
            .send(&OutboundMessage {
                channel: "maixcam".into(),
                chat_id: "cam-99".into(),
                content: "x".into(),
                reply_to_message_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Temporary(_)));
    }

    #[tokio::test]
    async fn start_and_stop_round_trip_on_ephemeral_port() {
        let bus = Arc::new(MessageBus::new());
        let config = MaixCamConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 0,
            allow_from: vec![].into(),
        };
        let ch = MaixCamChannel::new(config, bus);
        ch.start().await.unwrap();
        assert!(ch.is_running());
        ch.stop().await.unwrap();
        assert!(!ch.is_running());
    }
}
