//! Shared adapter core: lifecycle flag, allow-list check, dedup cache and the
//! inbound message pipeline every adapter funnels through.

use crate::bus::{InboundMessage, MessageBus, Peer, SenderInfo};
use crate::util::{sanitize_content, truncate_chars};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Dedup cache bound; above this the oldest half is evicted.
const SEEN_IDS_CAP: usize = 10_000;
const SEEN_IDS_EVICT: usize = 5_000;

/// Default cap applied to inbound message content.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 65_536;

struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

/// State and behavior shared by every channel adapter.
pub struct BaseChannel {
    name: &'static str,
    bus: Arc<MessageBus>,
    running: AtomicBool,
    allow_from: Vec<String>,
    seen_ids: Mutex<SeenIds>,
    max_message_length: usize,
}

impl BaseChannel {
    pub fn new(name: &'static str, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self {
            name,
            bus,
            running: AtomicBool::new(false),
            allow_from,
            seen_ids: Mutex::new(SeenIds {
                set: HashSet::new(),
                order: VecDeque::new(),
            }),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Allow-list law: empty permits everyone, otherwise exact match on
    /// canonical or raw platform ID.
    pub fn is_allowed_sender(&self, sender: &SenderInfo) -> bool {
        crate::identity::is_allowed(&self.allow_from, &sender.canonical_id, &sender.platform_id)
    }

    /// Record `message_id` and report whether it was already seen. When the
    /// cache exceeds its bound the oldest half is evicted; duplicates of very
    /// old IDs are not a correctness concern since platforms retry within
    /// minutes.
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let mut seen = self
            .seen_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if seen.set.contains(message_id) {
            return true;
        }
        seen.set.insert(message_id.to_string());
        seen.order.push_back(message_id.to_string());
        if seen.set.len() > SEEN_IDS_CAP {
            for _ in 0..SEEN_IDS_EVICT {
                if let Some(old) = seen.order.pop_front() {
                    seen.set.remove(&old);
                }
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn seen_ids_len(&self) -> usize {
        self.seen_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .set
            .len()
    }

    /// The inbound pipeline: dedup, allow-list, sanitize, length cap, publish.
    /// Rejections are silent (debug at most) and nothing here returns an error.
    pub fn handle_message(
        &self,
        peer: Peer,
        message_id: &str,
        content: &str,
        media_paths: Vec<String>,
        mut metadata: HashMap<String, String>,
        sender: SenderInfo,
    ) {
        if self.is_duplicate(message_id) {
            tracing::debug!("{}: duplicate message {message_id}, skipping", self.name);
            return;
        }

        if !self.is_allowed_sender(&sender) {
            tracing::debug!(
                "{}: sender {} not in allow-list, skipping",
                self.name,
                sender.canonical_id
            );
            return;
        }

        let mut content = sanitize_content(content);
        if content.is_empty() {
            return;
        }

        if content.len() > self.max_message_length {
            content = truncate_chars(&content, self.max_message_length).to_string();
            metadata.insert("truncated".into(), "true".into());
        }

        self.bus.publish_inbound(InboundMessage {
            channel: self.name.to_string(),
            message_id: message_id.to_string(),
            sender,
            peer,
            content,
            media_paths,
            metadata,
            received_at: chrono::Utc::now(),
        });
    }
}
