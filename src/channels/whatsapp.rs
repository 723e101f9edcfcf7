//! WhatsApp channel — connects to a WhatsApp Web bridge over WebSocket with a
//! sqlite-backed session store for pairing state.
//!
//! Lifecycle is the most involved of all adapters: an unpaired session
//! subscribes to the bridge's QR event stream and renders each code to the
//! terminal until pairing completes; a `disconnected` event triggers a
//! single-flight reconnect loop with exponential backoff (5s doubling to a
//! 5-minute cap). `stop` must never race a task spawn, so the `stopping`
//! flag and every tracked spawn happen under the same lifecycle mutex.

use super::base::BaseChannel;
use super::{Channel, ChannelError};
use crate::bus::{MessageBus, OutboundMessage, Peer, PeerKind, SenderInfo};
use crate::config::WhatsAppConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8055/ws";
const STORE_DB_NAME: &str = "store.db";

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(300);

/// Bound on waiting for owned tasks during `stop`.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// sqlite-backed session store. A single connection behind a mutex keeps the
/// store serialized the way the bridge protocol expects.
struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let conn = Connection::open(dir.join(STORE_DB_NAME))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 jid TEXT NOT NULL,
                 registered_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn device_jid(&self) -> anyhow::Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT jid FROM device WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn save_device(&self, jid: &str) -> anyhow::Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conn.execute(
            "INSERT INTO device (id, jid, registered_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET jid = ?1, registered_at = ?2",
            rusqlite::params![jid, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Default)]
struct LifecycleFlags {
    reconnecting: bool,
    stopping: bool,
}

/// State shared by the reader, writer and reconnect tasks.
struct Shared {
    base: Arc<BaseChannel>,
    bridge_url: String,
    store: SessionStore,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    paired: AtomicBool,
    flags: Mutex<LifecycleFlags>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Shared {
    /// Spawn a task on the tracker unless `stop` has begun. The `stopping`
    /// check and the spawn are atomic with respect to `stop` setting the flag
    /// and entering the tracker wait — this closes the TOCTOU where a task
    /// could be added after the wait started.
    fn spawn_tracked<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut flags = self
            .flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if flags.stopping {
            return false;
        }
        self.tracker.spawn(fut);
        drop(flags);
        true
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self
            .outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = tx;
    }

    fn outgoing(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

pub struct WhatsAppChannel {
    base: Arc<BaseChannel>,
    config: WhatsAppConfig,
    store_path: PathBuf,
    shared: Mutex<Option<Arc<Shared>>>,
}

impl WhatsAppChannel {
    /// `store_path` is the directory for the sqlite session store
    /// (e.g. `~/.picoclaw/workspace/whatsapp`).
    pub fn new(config: WhatsAppConfig, bus: Arc<MessageBus>, store_path: PathBuf) -> Self {
        Self {
            base: Arc::new(BaseChannel::new(
                "whatsapp",
                bus,
                config.allow_from.to_vec(),
            )),
            config,
            store_path,
            shared: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(
            "Starting WhatsApp channel (store: {})",
            self.store_path.display()
        );

        let store = SessionStore::open(&self.store_path)?;
        let paired = store.device_jid()?.is_some();

        let bridge_url = if self.config.bridge_url.is_empty() {
            DEFAULT_BRIDGE_URL.to_string()
        } else {
            self.config.bridge_url.clone()
        };

        let shared = Arc::new(Shared {
            base: Arc::clone(&self.base),
            bridge_url,
            store,
            outgoing: Mutex::new(None),
            connected: AtomicBool::new(false),
            paired: AtomicBool::new(paired),
            flags: Mutex::new(LifecycleFlags::default()),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        });

        if let Err(e) = connect_bridge(&shared).await {
            // Rollback: no tasks may stay alive after a failed start.
            shared.token.cancel();
            shared.tracker.close();
            let _ = tokio::time::timeout(STOP_WAIT, shared.tracker.wait()).await;
            return Err(e);
        }

        if !paired {
            tracing::info!("WhatsApp not paired; waiting for QR login");
            if let Some(tx) = shared.outgoing() {
                let _ = tx.send(serde_json::json!({"type": "subscribe_qr"}).to_string());
            }
        }

        *self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(shared);
        self.base.set_running(true);
        tracing::info!("WhatsApp channel connected");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let shared = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(shared) = shared else {
            self.base.set_running(false);
            return Ok(());
        };

        tracing::info!("Stopping WhatsApp channel");

        // Mark stopping under the lifecycle mutex so no further tracked task
        // can be spawned once we begin waiting.
        {
            let mut flags = shared
                .flags
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            flags.stopping = true;
        }

        shared.token.cancel();
        shared.set_outgoing(None);
        shared.tracker.close();
        if tokio::time::timeout(STOP_WAIT, shared.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("WhatsApp stop timed out waiting for background tasks");
        }

        self.base.set_running(false);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.base.is_running() {
            return Err(ChannelError::NotRunning);
        }

        let shared = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(shared) = shared else {
            return Err(ChannelError::NotRunning);
        };

        if !shared.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::temporary(
                "whatsapp connection not established",
            ));
        }
        if !shared.paired.load(Ordering::SeqCst) {
            return Err(ChannelError::temporary(
                "whatsapp not yet paired (QR login pending)",
            ));
        }

        let to = msg.chat_id.trim();
        if to.is_empty() {
            return Err(ChannelError::permanent("empty whatsapp chat id"));
        }

        let frame = serde_json::json!({
            "type": "send",
            "to": to,
            "content": msg.content,
        })
        .to_string();

        match shared.outgoing() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(ChannelError::temporary("whatsapp bridge socket closed")),
        }
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// Dial the bridge and attach reader/writer tasks. On success
/// `shared.connected` is true and the outgoing sender installed.
async fn connect_bridge(shared: &Arc<Shared>) -> anyhow::Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(&shared.bridge_url).await?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    shared.set_outgoing(Some(tx));
    shared.connected.store(true, Ordering::SeqCst);

    // Writer: drains the outgoing queue into the socket.
    let writer_token = shared.token.clone();
    if !shared.spawn_tracked(async move {
        loop {
            tokio::select! {
                () = writer_token.cancelled() => return,
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    if write.send(WsMsg::Text(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }) {
        anyhow::bail!("channel stopped during connect");
    }

    // Reader: decodes bridge events until the stream ends, then hands off to
    // the reconnect machinery.
    let reader_shared = Arc::clone(shared);
    if !shared.spawn_tracked(async move {
        loop {
            let frame = tokio::select! {
                () = reader_shared.token.cancelled() => return,
                f = read.next() => f,
            };

            match frame {
                Some(Ok(WsMsg::Text(text))) => {
                    if let Ok(event) = serde_json::from_str::<serde_json::Value>(&text) {
                        handle_bridge_event(&reader_shared, &event);
                    }
                }
                Some(Ok(WsMsg::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }

        reader_shared.connected.store(false, Ordering::SeqCst);
        if !reader_shared.token.is_cancelled() {
            tracing::info!("WhatsApp disconnected, will attempt reconnection");
            on_disconnected(&reader_shared);
        }
    }) {
        anyhow::bail!("channel stopped during connect");
    }

    Ok(())
}

/// Single-flight reconnect trigger. The `reconnecting` and `stopping` checks
/// and the task spawn all hold the lifecycle mutex, so a concurrent `stop`
/// either sees the spawned task or prevents it — never half of each.
fn on_disconnected(shared: &Arc<Shared>) {
    let mut flags = shared
        .flags
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if flags.reconnecting || flags.stopping {
        return;
    }
    flags.reconnecting = true;
    let reconnect_shared = Arc::clone(shared);
    shared.tracker.spawn(async move {
        reconnect_with_backoff(&reconnect_shared).await;
        let mut flags = reconnect_shared
            .flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        flags.reconnecting = false;
    });
}

async fn reconnect_with_backoff(shared: &Arc<Shared>) {
    let mut backoff = RECONNECT_INITIAL;
    loop {
        if shared.token.is_cancelled() {
            return;
        }

        tracing::info!("WhatsApp reconnecting (backoff {backoff:?})");
        match connect_bridge(shared).await {
            Ok(()) => {
                tracing::info!("WhatsApp reconnected");
                return;
            }
            Err(e) => tracing::warn!("WhatsApp reconnect failed: {e}"),
        }

        tokio::select! {
            () = shared.token.cancelled() => return,
            () = tokio::time::sleep(backoff) => {
                backoff = next_backoff(backoff);
            }
        }
    }
}

/// Doubling backoff capped at five minutes.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

fn handle_bridge_event(shared: &Arc<Shared>, event: &serde_json::Value) {
    match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "qr" => {
            if let Some(code) = event.get("code").and_then(|c| c.as_str()) {
                print_qr(code);
            }
        }
        "pair_success" => {
            let jid = event.get("jid").and_then(|j| j.as_str()).unwrap_or("");
            if let Err(e) = shared.store.save_device(jid) {
                tracing::warn!("Failed to persist WhatsApp device: {e}");
            }
            shared.paired.store(true, Ordering::SeqCst);
            tracing::info!("WhatsApp paired as {jid}");
        }
        "disconnected" => {
            shared.connected.store(false, Ordering::SeqCst);
            tracing::info!("WhatsApp disconnected, will attempt reconnection");
            on_disconnected(shared);
        }
        "message" => handle_incoming(shared, event),
        other => tracing::debug!("WhatsApp bridge event: {other}"),
    }
}

fn handle_incoming(shared: &Arc<Shared>, event: &serde_json::Value) {
    let sender_id = event
        .get("sender")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    let chat_id = event
        .get("chat")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let content = event
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if sender_id.is_empty() || chat_id.is_empty() {
        return;
    }

    let message_id = event
        .get("id")
        .and_then(|i| i.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let push_name = event
        .get("push_name")
        .and_then(|p| p.as_str())
        .unwrap_or_default();

    // Group JIDs live on the g.us server.
    let kind = if chat_id.ends_with("@g.us") {
        PeerKind::Group
    } else {
        PeerKind::Direct
    };

    let mut metadata = HashMap::new();
    metadata.insert("message_id".into(), message_id.clone());
    metadata.insert("peer_kind".into(), kind.to_string());
    metadata.insert(
        "peer_id".into(),
        if kind == PeerKind::Group {
            chat_id.to_string()
        } else {
            sender_id.to_string()
        },
    );
    if !push_name.is_empty() {
        metadata.insert("user_name".into(), push_name.to_string());
    }

    shared.base.handle_message(
        Peer {
            kind,
            id: chat_id.to_string(),
        },
        &message_id,
        content,
        vec![],
        metadata,
        SenderInfo::new("whatsapp", sender_id).with_display_name(push_name),
    );
}

/// Render a pairing QR code to the terminal as unicode half-blocks.
fn print_qr(code: &str) {
    match qrcode::QrCode::new(code) {
        Ok(qr) => {
            let rendered = qr
                .render::<qrcode::render::unicode::Dense1x2>()
                .quiet_zone(true)
                .build();
            println!("Scan this QR code with WhatsApp (Linked Devices):");
            println!("{rendered}");
        }
        Err(e) => tracing::warn!("Failed to render WhatsApp QR code: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shared_for_test(store_dir: &Path) -> Arc<Shared> {
        Arc::new(Shared {
            base: Arc::new(BaseChannel::new(
                "whatsapp",
                Arc::new(MessageBus::new()),
                vec![],
            )),
            bridge_url: DEFAULT_BRIDGE_URL.into(),
            store: SessionStore::open(store_dir).unwrap(),
            outgoing: Mutex::new(None),
            connected: AtomicBool::new(false),
            paired: AtomicBool::new(false),
            flags: Mutex::new(LifecycleFlags::default()),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        })
    }

    #[test]
    fn session_store_round_trips_device() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        assert!(store.device_jid().unwrap().is_none());
        store.save_device("8613800138000@s.whatsapp.net").unwrap();
        assert_eq!(
            store.device_jid().unwrap().as_deref(),
            Some("8613800138000@s.whatsapp.net")
        );
        // Upsert replaces rather than duplicating.
        store.save_device("other@s.whatsapp.net").unwrap();
        assert_eq!(
            store.device_jid().unwrap().as_deref(),
            Some("other@s.whatsapp.net")
        );
    }

    #[test]
    fn backoff_schedule_doubles_to_cap() {
        let mut backoff = RECONNECT_INITIAL;
        let mut schedule = vec![];
        for _ in 0..8 {
            schedule.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(schedule, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[tokio::test]
    async fn inbound_direct_message_maps_sender_and_peer() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_for_test(tmp.path());
        let event = serde_json::json!({
            "type": "message",
            "id": "MSG1",
            "sender": "8613800138000@s.whatsapp.net",
            "chat": "8613800138000@s.whatsapp.net",
            "content": "hi",
            "push_name": "Zhang San",
        });
        handle_bridge_event(&shared, &event);

        let msg = shared.base.bus().next_inbound().await;
        assert_eq!(msg.channel, "whatsapp");
        assert_eq!(
            msg.sender.canonical_id,
            "whatsapp:8613800138000@s.whatsapp.net"
        );
        assert_eq!(msg.peer.kind, PeerKind::Direct);
        assert_eq!(msg.peer.id, "8613800138000@s.whatsapp.net");
        assert_eq!(msg.content, "hi");
    }

    #[tokio::test]
    async fn group_chat_is_group_peer() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_for_test(tmp.path());
        let event = serde_json::json!({
            "type": "message",
            "id": "MSG2",
            "sender": "8613800138000@s.whatsapp.net",
            "chat": "12036304@g.us",
            "content": "hello group",
        });
        handle_bridge_event(&shared, &event);
        let msg = shared.base.bus().next_inbound().await;
        assert_eq!(msg.peer.kind, PeerKind::Group);
        assert_eq!(msg.metadata.get("peer_id").map(String::as_str), Some("12036304@g.us"));
    }

    #[tokio::test]
    async fn pair_success_persists_device() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_for_test(tmp.path());
        let event = serde_json::json!({"type": "pair_success", "jid": "me@s.whatsapp.net"});
        handle_bridge_event(&shared, &event);
        assert!(shared.paired.load(Ordering::SeqCst));
        assert_eq!(
            shared.store.device_jid().unwrap().as_deref(),
            Some("me@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn disconnect_is_single_flight() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_for_test(tmp.path());
        // Two rapid disconnect events must start only one reconnect task.
        on_disconnected(&shared);
        on_disconnected(&shared);
        assert!(shared.flags.lock().unwrap().reconnecting);
        assert_eq!(shared.tracker.len(), 1);
        shared.token.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn stopping_flag_blocks_new_spawns() {
        let tmp = TempDir::new().unwrap();
        let shared = shared_for_test(tmp.path());
        shared.flags.lock().unwrap().stopping = true;
        assert!(!shared.spawn_tracked(async {}));
        // A disconnect after stop began must not start a reconnect task.
        on_disconnected(&shared);
        assert_eq!(shared.tracker.len(), 0);
    }

    #[tokio::test]
    async fn send_states_map_to_error_taxonomy() {
        let tmp = TempDir::new().unwrap();
        let bus = Arc::new(MessageBus::new());
        let ch = WhatsAppChannel::new(
            WhatsAppConfig::default(),
            bus,
            tmp.path().join("whatsapp"),
        );
        let msg = OutboundMessage {
            channel: "whatsapp".into(),
            chat_id: "8613800138000@s.whatsapp.net".into(),
            content: "hi".into(),
            reply_to_message_id: None,
        };

        // Not started yet.
        assert!(matches!(
            ch.send(&msg).await.unwrap_err(),
            ChannelError::NotRunning
        ));

        // Running but disconnected.
        let shared = shared_for_test(&tmp.path().join("whatsapp"));
        *ch.shared.lock().unwrap() = Some(Arc::clone(&shared));
        ch.base.set_running(true);
        assert!(matches!(
            ch.send(&msg).await.unwrap_err(),
            ChannelError::Temporary(_)
        ));

        // Connected but unpaired.
        shared.connected.store(true, Ordering::SeqCst);
        let err = ch.send(&msg).await.unwrap_err();
        assert!(err.to_string().contains("paired"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let bus = Arc::new(MessageBus::new());
        let ch = WhatsAppChannel::new(
            WhatsAppConfig::default(),
            bus,
            tmp.path().join("whatsapp"),
        );
        ch.stop().await.unwrap();
        ch.stop().await.unwrap();
        assert!(!ch.is_running());
    }
}
