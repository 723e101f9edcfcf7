//! PicoClaw — ultra-lightweight personal AI agent gateway.
//!
//! The gateway bridges external chat platforms (WhatsApp, Telegram, Discord,
//! Slack, Feishu, DingTalk, LINE, OneBot, QQ, WeCom, MaixCam) onto a single
//! in-process message bus that feeds an LLM-backed agent. The launcher binary
//! supervises the gateway process and hosts the config/auth HTTP API.

pub mod agent;
pub mod auth;
pub mod bus;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod launcher;
pub mod logging;
pub mod migrate;
pub mod util;

/// Crate version reported by `/health` and the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
