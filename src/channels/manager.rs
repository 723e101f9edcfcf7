//! Channel manager — constructs the enabled adapters from config, starts them,
//! and stops them concurrently within a bounded window.

use super::{
    dingtalk::DingTalkChannel, discord::DiscordChannel, feishu::FeishuChannel, line::LineChannel,
    maixcam::MaixCamChannel, onebot::OneBotChannel, qq::QQChannel, slack::SlackChannel,
    telegram::TelegramChannel, wecom::WeComChannel, wecom_app::WeComAppChannel,
    whatsapp::WhatsAppChannel, Channel,
};
use crate::bus::MessageBus;
use crate::config::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelManager {
    /// Build the set of enabled adapters. Adapters whose constructor fails
    /// (e.g. a bad proxy URL) are skipped with a warning.
    pub fn from_config(config: &Config, bus: Arc<MessageBus>, workspace: &Path) -> Self {
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        let ch = &config.channels;

        if ch.whatsapp.enabled {
            channels.push(Arc::new(WhatsAppChannel::new(
                ch.whatsapp.clone(),
                Arc::clone(&bus),
                workspace.join("whatsapp"),
            )));
        }
        if ch.telegram.enabled {
            match TelegramChannel::new(ch.telegram.clone(), Arc::clone(&bus)) {
                Ok(telegram) => channels.push(Arc::new(telegram)),
                Err(e) => tracing::warn!("Skipping telegram channel: {e}"),
            }
        }
        if ch.discord.enabled {
            channels.push(Arc::new(DiscordChannel::new(
                ch.discord.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.slack.enabled {
            channels.push(Arc::new(SlackChannel::new(
                ch.slack.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.line.enabled {
            channels.push(Arc::new(LineChannel::new(
                ch.line.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.feishu.enabled {
            channels.push(Arc::new(FeishuChannel::new(
                ch.feishu.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.dingtalk.enabled {
            channels.push(Arc::new(DingTalkChannel::new(
                ch.dingtalk.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.onebot.enabled {
            channels.push(Arc::new(OneBotChannel::new(
                ch.onebot.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.qq.enabled {
            channels.push(Arc::new(QQChannel::new(ch.qq.clone(), Arc::clone(&bus))));
        }
        if ch.wecom.enabled {
            channels.push(Arc::new(WeComChannel::new(
                ch.wecom.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.wecom_app.enabled {
            channels.push(Arc::new(WeComAppChannel::new(
                ch.wecom_app.clone(),
                Arc::clone(&bus),
            )));
        }
        if ch.maixcam.enabled {
            channels.push(Arc::new(MaixCamChannel::new(
                ch.maixcam.clone(),
                Arc::clone(&bus),
            )));
        }

        Self { bus, channels }
    }

    pub fn has_enabled_channel(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Start every adapter and register the successful ones with the bus.
    /// Returns the per-channel failures; a failed adapter owns no tasks and
    /// stays unregistered.
    pub async fn start_all(&self) -> Vec<(&'static str, anyhow::Error)> {
        let mut failures = Vec::new();
        for channel in &self.channels {
            match channel.start().await {
                Ok(()) => {
                    self.bus.register_channel(Arc::clone(channel));
                    tracing::info!("Channel '{}' started", channel.name());
                }
                Err(e) => {
                    tracing::error!("Channel '{}' failed to start: {e}", channel.name());
                    failures.push((channel.name(), e));
                }
            }
        }
        failures
    }

    /// Stop all adapters concurrently, bounding the whole shutdown by
    /// `timeout`.
    pub async fn stop_all(&self, timeout: Duration) {
        let stops = self.channels.iter().map(|channel| {
            let channel = Arc::clone(channel);
            async move {
                if let Err(e) = channel.stop().await {
                    tracing::warn!("Channel '{}' stop error: {e}", channel.name());
                }
            }
        });

        if tokio::time::timeout(timeout, futures_util::future::join_all(stops))
            .await
            .is_err()
        {
            tracing::warn!("Channel shutdown timed out after {timeout:?}");
        }

        for channel in &self.channels {
            self.bus.unregister_channel(channel.name());
        }
    }

    /// Manager readiness: any adapter running.
    pub fn any_running(&self) -> bool {
        self.channels.iter().any(|c| c.is_running())
    }

    /// `(name, running)` for the health endpoint.
    pub fn statuses(&self) -> Vec<(String, bool)> {
        self.channels
            .iter()
            .map(|c| (c.name().to_string(), c.is_running()))
            .collect()
    }
}
