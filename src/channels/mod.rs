//! Channel adapters bridging external chat platforms to the message bus.

pub mod base;
pub mod dingtalk;
pub mod discord;
pub mod feishu;
pub mod line;
pub mod maixcam;
pub mod manager;
pub mod onebot;
pub mod qq;
pub mod slack;
pub mod telegram;
pub mod wecom;
pub mod wecom_app;
pub mod wecom_crypto;
pub mod whatsapp;

pub use base::BaseChannel;
pub use manager::ChannelManager;

use crate::bus::OutboundMessage;
use async_trait::async_trait;

/// Adapter error taxonomy the bus retry logic matches on.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The adapter is not running; the bus may retry.
    #[error("channel not running")]
    NotRunning,
    /// Connectivity, rate-limit or unpaired state — eligible for retry.
    #[error("temporary channel failure: {0}")]
    Temporary(String),
    /// Bad request or unknown peer — the message is dropped.
    #[error("permanent channel failure: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }
}

/// Uniform adapter contract.
///
/// `start` must not block: background work runs on spawned tasks owned by the
/// adapter. `stop` is idempotent, signals all owned tasks, and waits a bounded
/// time for them; after it returns `is_running()` is false and the adapter
/// publishes nothing further. `send` encodes an outbound reply back onto the
/// platform.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;

    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_and_permanent_constructors() {
        assert!(matches!(
            ChannelError::temporary("rate limited"),
            ChannelError::Temporary(_)
        ));
        assert!(matches!(
            ChannelError::permanent("unknown peer"),
            ChannelError::Permanent(_)
        ));
    }

    #[test]
    fn error_messages_include_reason() {
        let err = ChannelError::temporary("socket closed");
        assert!(err.to_string().contains("socket closed"));
    }
}
