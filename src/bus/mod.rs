//! Typed in-process message bus.
//!
//! Inbound messages flow from channel adapters into a bounded queue consumed
//! by the gateway dispatcher. Outbound replies are routed back to the owning
//! adapter through a per-channel serializing worker, so `publish_outbound`
//! order is preserved for each `(channel, chat_id)` pair.

use crate::channels::{Channel, ChannelError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Inbound queue capacity. Overflow drops the oldest message.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Outbound delivery retry schedule: 1s initial, doubling, capped at 30s.
const OUTBOUND_RETRY_INITIAL: Duration = Duration::from_secs(1);
const OUTBOUND_RETRY_CAP: Duration = Duration::from_secs(30);
const OUTBOUND_RETRY_ATTEMPTS: u32 = 5;

/// Where a conversation happens within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// A routable chat endpoint: `(channel, kind, id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
}

impl Peer {
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Direct,
            id: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Group,
            id: id.into(),
        }
    }
}

/// Who sent a message. `canonical_id` is stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub platform: String,
    pub platform_id: String,
    pub canonical_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl SenderInfo {
    pub fn new(platform: &str, platform_id: impl Into<String>) -> Self {
        let platform_id = platform_id.into();
        Self {
            platform: platform.to_string(),
            canonical_id: crate::identity::canonical_id(platform, &platform_id),
            platform_id,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.display_name = Some(name);
        }
        self
    }
}

/// A normalized platform event published by an adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub message_id: String,
    pub sender: SenderInfo,
    pub peer: Peer,
    pub content: String,
    pub media_paths: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// A reply addressed back to a channel peer.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to_message_id: Option<String>,
}

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no channel registered for '{0}'")]
    ChannelUnknown(String),
}

struct InboundQueue {
    messages: Mutex<VecDeque<InboundMessage>>,
    notify: Notify,
    dropped: AtomicU64,
}

struct OutboundRoute {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    worker: JoinHandle<()>,
}

/// The in-process broker connecting adapters to the gateway dispatcher.
pub struct MessageBus {
    inbound: InboundQueue,
    routes: RwLock<HashMap<String, OutboundRoute>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inbound: InboundQueue {
                messages: Mutex::new(VecDeque::with_capacity(INBOUND_QUEUE_CAPACITY)),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            },
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an inbound message. Never blocks: when the queue is full the
    /// oldest entry is dropped and counted.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        {
            let mut queue = self
                .inbound
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.len() >= INBOUND_QUEUE_CAPACITY {
                queue.pop_front();
                let dropped = self.inbound.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Inbound bus queue full; dropped oldest message (total dropped: {dropped})"
                );
            }
            queue.push_back(msg);
        }
        self.inbound.notify.notify_one();
    }

    /// Receive the next inbound message. Intended for a single consumer (the
    /// gateway dispatcher); delivery is FIFO per publisher.
    pub async fn next_inbound(&self) -> InboundMessage {
        loop {
            let notified = self.inbound.notify.notified();
            if let Some(msg) = {
                let mut queue = self
                    .inbound
                    .messages
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                queue.pop_front()
            } {
                return msg;
            }
            notified.await;
        }
    }

    /// Messages discarded by inbound overflow since startup.
    pub fn dropped_inbound(&self) -> u64 {
        self.inbound.dropped.load(Ordering::Relaxed)
    }

    /// Register an adapter for outbound routing. Spawns the per-channel
    /// serializing worker that owns delivery and retry.
    pub fn register_channel(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let worker_channel = Arc::clone(&channel);
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                deliver_with_retry(&worker_name, worker_channel.as_ref(), msg).await;
            }
        });

        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = routes.insert(name, OutboundRoute { tx, worker }) {
            old.worker.abort();
        }
    }

    /// Remove an adapter's route and stop its worker.
    pub fn unregister_channel(&self, name: &str) {
        let route = {
            let mut routes = self
                .routes
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            routes.remove(name)
        };
        if let Some(route) = route {
            drop(route.tx);
            route.worker.abort();
        }
    }

    /// Route an outbound message to its channel's delivery worker.
    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        let routes = self
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let route = routes
            .get(&msg.channel)
            .ok_or_else(|| BusError::ChannelUnknown(msg.channel.clone()))?;
        route
            .tx
            .send(msg)
            .map_err(|e| BusError::ChannelUnknown(e.0.channel))
    }

    /// Channel names with a registered outbound route.
    pub fn registered_channels(&self) -> Vec<String> {
        let routes = self
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        routes.keys().cloned().collect()
    }

    /// Tear down all outbound workers.
    pub fn shutdown(&self) {
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, route) in routes.drain() {
            drop(route.tx);
            route.worker.abort();
        }
    }
}

/// Deliver one outbound message, retrying temporary failures with exponential
/// backoff (1s, 2s, 4s, … capped at 30s, at most 5 attempts).
async fn deliver_with_retry(name: &str, channel: &dyn Channel, msg: OutboundMessage) {
    let mut backoff = OUTBOUND_RETRY_INITIAL;
    for attempt in 1..=OUTBOUND_RETRY_ATTEMPTS {
        match channel.send(&msg).await {
            Ok(()) => return,
            Err(ChannelError::Permanent(reason)) => {
                tracing::warn!("Dropping outbound message for '{name}': {reason}");
                return;
            }
            Err(err) => {
                if attempt == OUTBOUND_RETRY_ATTEMPTS {
                    tracing::warn!(
                        "Outbound delivery to '{name}' failed after {attempt} attempts: {err}"
                    );
                    return;
                }
                tracing::debug!(
                    "Outbound delivery to '{name}' failed (attempt {attempt}): {err}; \
                     retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(OUTBOUND_RETRY_CAP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn inbound(channel: &str, id: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.into(),
            message_id: id.into(),
            sender: SenderInfo::new(channel, "alice"),
            peer: Peer::direct("alice"),
            content: "hi".into(),
            media_paths: vec![],
            metadata: HashMap::new(),
            received_at: chrono::Utc::now(),
        }
    }

    struct RecordingChannel {
        sent: AtomicUsize,
        fail_first: AtomicUsize,
        running: std::sync::atomic::AtomicBool,
    }

    impl RecordingChannel {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
                running: std::sync::atomic::AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, _msg: &OutboundMessage) -> Result<(), ChannelError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChannelError::Temporary("transient".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn inbound_is_fifo() {
        let bus = MessageBus::new();
        bus.publish_inbound(inbound("t", "1"));
        bus.publish_inbound(inbound("t", "2"));
        assert_eq!(bus.next_inbound().await.message_id, "1");
        assert_eq!(bus.next_inbound().await.message_id, "2");
    }

    #[tokio::test]
    async fn inbound_overflow_drops_oldest() {
        let bus = MessageBus::new();
        for i in 0..=INBOUND_QUEUE_CAPACITY {
            bus.publish_inbound(inbound("t", &i.to_string()));
        }
        assert_eq!(bus.dropped_inbound(), 1);
        // Message "0" was evicted; the head is now "1".
        assert_eq!(bus.next_inbound().await.message_id, "1");
    }

    #[tokio::test]
    async fn outbound_unknown_channel_errors() {
        let bus = MessageBus::new();
        let err = bus
            .publish_outbound(OutboundMessage {
                channel: "nope".into(),
                chat_id: "c".into(),
                content: "x".into(),
                reply_to_message_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, BusError::ChannelUnknown(name) if name == "nope"));
    }

    #[tokio::test]
    async fn outbound_delivers_to_registered_channel() {
        let bus = MessageBus::new();
        let ch = RecordingChannel::new(0);
        bus.register_channel(ch.clone());
        bus.publish_outbound(OutboundMessage {
            channel: "recording".into(),
            chat_id: "c".into(),
            content: "x".into(),
            reply_to_message_id: None,
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while ch.sent.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message was never delivered");
        bus.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_retries_temporary_failures() {
        let ch = RecordingChannel::new(2);
        deliver_with_retry(
            "recording",
            ch.as_ref(),
            OutboundMessage {
                channel: "recording".into(),
                chat_id: "c".into(),
                content: "x".into(),
                reply_to_message_id: None,
            },
        )
        .await;
        assert_eq!(ch.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failure_drops_without_retry() {
        struct PermanentFail;
        #[async_trait]
        impl Channel for PermanentFail {
            fn name(&self) -> &'static str {
                "perm"
            }
            async fn start(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn stop(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn send(&self, _msg: &OutboundMessage) -> Result<(), ChannelError> {
                Err(ChannelError::Permanent("bad peer".into()))
            }
            fn is_running(&self) -> bool {
                true
            }
        }

        // Completes immediately despite the 1s backoff schedule: no retries.
        tokio::time::timeout(
            Duration::from_millis(100),
            deliver_with_retry(
                "perm",
                &PermanentFail,
                OutboundMessage {
                    channel: "perm".into(),
                    chat_id: "c".into(),
                    content: "x".into(),
                    reply_to_message_id: None,
                },
            ),
        )
        .await
        .expect("permanent failure should not be retried");
    }
}
