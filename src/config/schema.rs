//! Canonical JSON config schema (`~/.picoclaw/config.json`).

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

// ── FlexibleStringList ────────────────────────────────────────────

/// A string list that accepts either a JSON array or a comma-separated
/// string. Hand-edited configs often use the latter; saving always
/// normalizes to an array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FlexibleStringList(pub Vec<String>);

impl FlexibleStringList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl From<Vec<String>> for FlexibleStringList {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

impl std::ops::Deref for FlexibleStringList {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for FlexibleStringList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ListOrCommaString;

        impl<'de> Visitor<'de> for ListOrCommaString {
            type Value = FlexibleStringList;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a string list or a comma-separated string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let items = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(FlexibleStringList(items))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(FlexibleStringList(items))
            }
        }

        deserializer.deserialize_any(ListOrCommaString)
    }
}

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub model_list: Vec<ModelConfig>,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
}

// ── Channels ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub qq: QQConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub dingtalk: DingTalkConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub onebot: OneBotConfig,
    #[serde(default)]
    pub wecom: WeComConfig,
    #[serde(default)]
    pub wecom_app: WeComAppConfig,
    #[serde(default)]
    pub maixcam: MaixCamConfig,
}

impl ChannelsConfig {
    /// `(name, enabled)` pairs in routing order.
    pub fn enabled_flags(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("whatsapp", self.whatsapp.enabled),
            ("telegram", self.telegram.enabled),
            ("discord", self.discord.enabled),
            ("slack", self.slack.enabled),
            ("line", self.line.enabled),
            ("feishu", self.feishu.enabled),
            ("dingtalk", self.dingtalk.enabled),
            ("onebot", self.onebot.enabled),
            ("qq", self.qq.enabled),
            ("wecom", self.wecom.enabled),
            ("wecom_app", self.wecom_app.enabled),
            ("maixcam", self.maixcam.enabled),
        ]
    }

    pub fn any_enabled(&self) -> bool {
        self.enabled_flags().iter().any(|(_, on)| *on)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub mention_only: bool,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QQConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bridge_url: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub encrypt_key: String,
    #[serde(default)]
    pub verification_token: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DingTalkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub channel_secret: String,
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default = "default_webhook_host")]
    pub webhook_host: String,
    #[serde(default = "default_line_webhook_port")]
    pub webhook_port: u16,
    #[serde(default = "default_line_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_secret: String::new(),
            channel_access_token: String::new(),
            webhook_host: default_webhook_host(),
            webhook_port: default_line_webhook_port(),
            webhook_path: default_line_webhook_path(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

fn default_webhook_host() -> String {
    "0.0.0.0".into()
}

fn default_line_webhook_port() -> u16 {
    18791
}

fn default_line_webhook_path() -> String {
    "/line/webhook".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneBotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_onebot_reconnect")]
    pub reconnect_interval: u64,
    #[serde(default)]
    pub group_trigger_prefix: FlexibleStringList,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

impl Default for OneBotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ws_url: String::new(),
            access_token: String::new(),
            reconnect_interval: default_onebot_reconnect(),
            group_trigger_prefix: FlexibleStringList::default(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

fn default_onebot_reconnect() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeComConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_host")]
    pub webhook_host: String,
    #[serde(default = "default_wecom_webhook_port")]
    pub webhook_port: u16,
    #[serde(default = "default_wecom_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout: u64,
}

impl Default for WeComConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            encoding_aes_key: String::new(),
            webhook_url: String::new(),
            webhook_host: default_webhook_host(),
            webhook_port: default_wecom_webhook_port(),
            webhook_path: default_wecom_webhook_path(),
            allow_from: FlexibleStringList::default(),
            reply_timeout: default_reply_timeout(),
        }
    }
}

fn default_wecom_webhook_port() -> u16 {
    18792
}

fn default_wecom_webhook_path() -> String {
    "/wecom/callback".into()
}

fn default_reply_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeComAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub corp_id: String,
    #[serde(default)]
    pub corp_secret: String,
    #[serde(default)]
    pub agent_id: i64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: String,
    #[serde(default = "default_webhook_host")]
    pub webhook_host: String,
    #[serde(default = "default_wecom_app_webhook_port")]
    pub webhook_port: u16,
    #[serde(default = "default_wecom_app_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout: u64,
}

impl Default for WeComAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            corp_id: String::new(),
            corp_secret: String::new(),
            agent_id: 0,
            token: String::new(),
            encoding_aes_key: String::new(),
            webhook_host: default_webhook_host(),
            webhook_port: default_wecom_app_webhook_port(),
            webhook_path: default_wecom_app_webhook_path(),
            allow_from: FlexibleStringList::default(),
            reply_timeout: default_reply_timeout(),
        }
    }
}

fn default_wecom_app_webhook_port() -> u16 {
    18793
}

fn default_wecom_app_webhook_path() -> String {
    "/wecom_app/callback".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaixCamConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_maixcam_host")]
    pub host: String,
    #[serde(default = "default_maixcam_port")]
    pub port: u16,
    #[serde(default)]
    pub allow_from: FlexibleStringList,
}

impl Default for MaixCamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_maixcam_host(),
            port: default_maixcam_port(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

fn default_maixcam_host() -> String {
    "0.0.0.0".into()
}

fn default_maixcam_port() -> u16 {
    18794
}

// ── Gateway & providers ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub antigravity: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flexible_list_accepts_array() {
        let list: FlexibleStringList = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(list.0, vec!["a", "b"]);
    }

    #[test]
    fn flexible_list_accepts_comma_string() {
        let list: FlexibleStringList = serde_json::from_str(r#""a, b , c""#).unwrap();
        assert_eq!(list.0, vec!["a", "b", "c"]);
    }

    #[test]
    fn flexible_list_drops_empty_segments() {
        let list: FlexibleStringList = serde_json::from_str(r#""a,,b,""#).unwrap();
        assert_eq!(list.0, vec!["a", "b"]);
    }

    #[test]
    fn flexible_list_normalizes_to_array_on_save() {
        let list: FlexibleStringList = serde_json::from_str(r#""x,y""#).unwrap();
        assert_eq!(serde_json::to_string(&list).unwrap(), r#"["x","y"]"#);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.gateway.port, 18790);
        assert!(!cfg.channels.any_enabled());
    }

    #[test]
    fn parses_documented_schema_fragment() {
        let raw = r#"{
            "agents": {"defaults": {"model": "claude", "model_name": "claude"}},
            "model_list": [{"model_name": "claude", "model": "anthropic/claude", "api_key": "sk"}],
            "channels": {
                "telegram": {"enabled": true, "token": "t", "allow_from": "alice,bob"},
                "whatsapp": {"enabled": true, "bridge_url": "ws://127.0.0.1:8055/ws"}
            },
            "gateway": {"host": "0.0.0.0", "port": 9000},
            "providers": {"openai": {"auth_method": "oauth"}}
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.channels.telegram.allow_from.0, vec!["alice", "bob"]);
        assert_eq!(cfg.channels.whatsapp.bridge_url, "ws://127.0.0.1:8055/ws");
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(
            cfg.providers.openai.auth_method.as_deref(),
            Some("oauth")
        );
        assert_eq!(cfg.model_list[0].model, "anthropic/claude");
    }

    #[test]
    fn enabled_flags_cover_all_twelve_channels() {
        let cfg = ChannelsConfig::default();
        assert_eq!(cfg.enabled_flags().len(), 12);
    }
}
