//! OpenClaw source: config schema subset and conversion into the PicoClaw
//! document.

use crate::config::{
    AgentDefaults, Config, DingTalkConfig, DiscordConfig, FeishuConfig, MaixCamConfig,
    ModelConfig, QQConfig, SlackConfig, TelegramConfig, WhatsAppConfig,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The subset of an OpenClaw `openclaw.json` this migration understands.
#[derive(Debug, Default, Deserialize)]
pub struct OpenClawConfig {
    #[serde(default)]
    pub agents: Option<OpenClawAgents>,
    #[serde(default)]
    pub channels: Option<OpenClawChannels>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub cron: Option<serde_json::Value>,
    #[serde(default)]
    pub hooks: Option<serde_json::Value>,
    #[serde(default)]
    pub skills: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenClawAgents {
    #[serde(default)]
    pub defaults: Option<OpenClawAgentDefaults>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenClawAgentDefaults {
    #[serde(default)]
    pub model: Option<OpenClawAgentModel>,
    #[serde(default)]
    pub workspace: Option<String>,
}

/// OpenClaw writes the model either as a bare string or `{primary, fallbacks}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenClawAgentModel {
    Simple(String),
    Detailed {
        #[serde(default)]
        primary: Option<String>,
    },
}

impl OpenClawAgentModel {
    fn primary(&self) -> Option<&str> {
        match self {
            Self::Simple(s) if !s.is_empty() => Some(s),
            Self::Detailed { primary } => primary.as_deref().filter(|p| !p.is_empty()),
            Self::Simple(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawChannels {
    #[serde(default)]
    pub telegram: Option<OpenClawChannel>,
    #[serde(default)]
    pub discord: Option<OpenClawChannel>,
    #[serde(default)]
    pub slack: Option<OpenClawChannel>,
    #[serde(default)]
    pub whatsapp: Option<OpenClawChannel>,
    #[serde(default)]
    pub feishu: Option<OpenClawChannel>,
    #[serde(default)]
    pub qq: Option<OpenClawChannel>,
    #[serde(default)]
    pub dingtalk: Option<OpenClawChannel>,
    #[serde(default)]
    pub maixcam: Option<OpenClawChannel>,
    #[serde(default)]
    pub signal: Option<serde_json::Value>,
    #[serde(default)]
    pub matrix: Option<serde_json::Value>,
    #[serde(default)]
    pub googlechat: Option<serde_json::Value>,
    #[serde(default)]
    pub msteams: Option<serde_json::Value>,
    #[serde(default)]
    pub irc: Option<serde_json::Value>,
    #[serde(default)]
    pub mattermost: Option<serde_json::Value>,
    #[serde(default)]
    pub imessage: Option<serde_json::Value>,
    #[serde(default)]
    pub bluebubbles: Option<serde_json::Value>,
}

/// OpenClaw channel blocks all share the same relevant shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClawChannel {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub app_token: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default)]
    pub bridge_url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

impl OpenClawChannel {
    fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Per-provider credentials stored by OpenClaw under
/// `agents/main/agent/models.json`.
#[derive(Debug, Default, Deserialize)]
struct ProviderModelsFile {
    #[serde(default)]
    providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Read the per-provider API keys and base URLs from the source home.
/// A missing or unparsable file yields an empty map.
pub fn provider_configs_from_dir(source_home: &Path) -> HashMap<String, ProviderEntry> {
    let path = source_home.join("agents/main/agent/models.json");
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return HashMap::new();
    };
    let Ok(file) = serde_json::from_str::<ProviderModelsFile>(&raw) else {
        return HashMap::new();
    };
    file.providers
        .into_iter()
        .map(|(name, entry)| (map_provider(&name), entry))
        .collect()
}

/// Load the source config, trying `openclaw.json` then `config.json`.
pub fn load_from_dir(dir: &Path) -> Result<(OpenClawConfig, PathBuf)> {
    for candidate in ["openclaw.json", "config.json"] {
        let path = dir.join(candidate);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let cfg = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            return Ok((cfg, path));
        }
    }
    anyhow::bail!(
        "no config file found in {} (tried openclaw.json, config.json)",
        dir.display()
    )
}

/// Convert to the PicoClaw schema, collecting warnings for everything the
/// target cannot express. `source_home` is consulted for the per-provider
/// credentials file so migrated installs keep their API keys.
pub fn convert(source: &OpenClawConfig, source_home: &Path) -> (Config, Vec<String>) {
    let mut cfg = Config::default();
    let mut warnings = Vec::new();

    let (provider, model_name) = default_model(source);
    cfg.agents.defaults = AgentDefaults {
        model: format!("{provider}/{model_name}"),
        model_name: model_name.clone(),
        workspace: source
            .agents
            .as_ref()
            .and_then(|a| a.defaults.as_ref())
            .and_then(|d| d.workspace.as_deref())
            .map(rewrite_workspace_path)
            .unwrap_or_default(),
    };

    let mut provider_configs = provider_configs_from_dir(source_home);
    let default_entry = provider_configs.remove(&provider).unwrap_or_default();
    cfg.model_list = vec![ModelConfig {
        model_name,
        model: cfg.agents.defaults.model.clone(),
        api_key: default_entry.api_key.unwrap_or_default(),
        api_base: default_entry.base_url.filter(|u| !u.is_empty()),
        ..ModelConfig::default()
    }];

    // Other providers with stored keys come along as extra model entries.
    let mut others: Vec<_> = provider_configs.into_iter().collect();
    others.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (name, entry) in others {
        let Some(api_key) = entry.api_key.filter(|k| !k.is_empty()) else {
            continue;
        };
        cfg.model_list.push(ModelConfig {
            model_name: name.clone(),
            model: format!("{name}/{name}"),
            api_key,
            api_base: entry.base_url.filter(|u| !u.is_empty()),
            ..ModelConfig::default()
        });
    }

    if let Some(channels) = &source.channels {
        convert_channels(channels, &mut cfg, &mut warnings);
    }

    if source.skills.is_some() {
        warnings.push("Skills not automatically migrated - reinstall via picoclaw CLI".into());
    }
    if source.cron.is_some() {
        warnings.push(
            "Cron job scheduling not supported in PicoClaw - consider using external schedulers"
                .into(),
        );
    }
    if source.hooks.is_some() {
        warnings.push("Webhook hooks not supported in PicoClaw - use event system instead".into());
    }
    if source.auth.is_some() {
        warnings.push(
            "Auth profiles (API keys, OAuth tokens) not migrated for security - log in again via the launcher"
                .into(),
        );
    }

    (cfg, warnings)
}

fn convert_channels(channels: &OpenClawChannels, cfg: &mut Config, warnings: &mut Vec<String>) {
    if let Some(tg) = &channels.telegram {
        cfg.channels.telegram = TelegramConfig {
            enabled: tg.enabled(),
            token: tg.bot_token.clone().or_else(|| tg.token.clone()).unwrap_or_default(),
            proxy: String::new(),
            allow_from: tg.allow_from.clone().into(),
        };
    }
    if let Some(dc) = &channels.discord {
        cfg.channels.discord = DiscordConfig {
            enabled: dc.enabled(),
            token: dc.token.clone().or_else(|| dc.bot_token.clone()).unwrap_or_default(),
            mention_only: false,
            allow_from: dc.allow_from.clone().into(),
        };
    }
    if let Some(sl) = &channels.slack {
        cfg.channels.slack = SlackConfig {
            enabled: sl.enabled(),
            bot_token: sl.bot_token.clone().unwrap_or_default(),
            app_token: sl.app_token.clone().unwrap_or_default(),
            allow_from: sl.allow_from.clone().into(),
        };
    }
    if let Some(wa) = &channels.whatsapp {
        cfg.channels.whatsapp = WhatsAppConfig {
            enabled: wa.enabled(),
            bridge_url: wa.bridge_url.clone().unwrap_or_default(),
            allow_from: wa.allow_from.clone().into(),
        };
    }
    if let Some(fs) = &channels.feishu {
        cfg.channels.feishu = FeishuConfig {
            enabled: fs.enabled(),
            app_id: fs.app_id.clone().unwrap_or_default(),
            app_secret: fs.app_secret.clone().unwrap_or_default(),
            encrypt_key: fs.encrypt_key.clone().unwrap_or_default(),
            verification_token: fs.verification_token.clone().unwrap_or_default(),
            allow_from: fs.allow_from.clone().into(),
        };
    }
    if let Some(qq) = &channels.qq {
        cfg.channels.qq = QQConfig {
            enabled: qq.enabled(),
            app_id: qq.app_id.clone().unwrap_or_default(),
            app_secret: qq.app_secret.clone().unwrap_or_default(),
            allow_from: qq.allow_from.clone().into(),
        };
    }
    if let Some(dt) = &channels.dingtalk {
        cfg.channels.dingtalk = DingTalkConfig {
            enabled: dt.enabled(),
            client_id: dt.app_id.clone().unwrap_or_default(),
            client_secret: dt.app_secret.clone().unwrap_or_default(),
            allow_from: dt.allow_from.clone().into(),
        };
    }
    if let Some(mc) = &channels.maixcam {
        cfg.channels.maixcam = MaixCamConfig {
            enabled: mc.enabled(),
            host: mc.host.clone().unwrap_or_else(|| "0.0.0.0".into()),
            port: mc.port.unwrap_or(18794),
            allow_from: mc.allow_from.clone().into(),
        };
    }

    for (name, present) in [
        ("signal", channels.signal.is_some()),
        ("matrix", channels.matrix.is_some()),
        ("googlechat", channels.googlechat.is_some()),
        ("msteams", channels.msteams.is_some()),
        ("irc", channels.irc.is_some()),
        ("mattermost", channels.mattermost.is_some()),
    ] {
        if present {
            warnings.push(format!("Channel '{name}': No PicoClaw adapter available"));
        }
    }
    if channels.imessage.is_some() {
        warnings.push("Channel 'imessage': macOS-only channel - requires manual setup".into());
    }
    if channels.bluebubbles.is_some() {
        warnings.push(
            "Channel 'bluebubbles': No PicoClaw adapter available - consider iMessage instead"
                .into(),
        );
    }
}

fn default_model(source: &OpenClawConfig) -> (String, String) {
    let fallback = || ("anthropic".to_string(), "claude-sonnet-4.6".to_string());

    let Some(primary) = source
        .agents
        .as_ref()
        .and_then(|a| a.defaults.as_ref())
        .and_then(|d| d.model.as_ref())
        .and_then(|m| m.primary())
    else {
        return fallback();
    };

    match primary.split_once('/') {
        Some((provider, model)) => (map_provider(provider), model.to_string()),
        None => ("anthropic".to_string(), primary.to_string()),
    }
}

fn map_provider(provider: &str) -> String {
    match provider.to_lowercase().as_str() {
        "claude" => "anthropic".into(),
        "gpt" => "openai".into(),
        "gemini" => "google".into(),
        "grok" => "xai".into(),
        other => other.to_string(),
    }
}

/// OpenClaw workspace paths point under `~/.openclaw`; rehome them.
pub fn rewrite_workspace_path(path: &str) -> String {
    path.replacen(".openclaw", ".picoclaw", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_channels_and_model() {
        let raw = serde_json::json!({
            "agents": {"defaults": {"model": "openai/gpt-5.2", "workspace": "~/.openclaw/workspace"}},
            "channels": {
                "telegram": {"botToken": "tg-token", "allowFrom": ["123"]},
                "whatsapp": {"bridgeUrl": "ws://127.0.0.1:8055/ws", "enabled": false},
                "dingtalk": {"appId": "ding-id", "appSecret": "ding-secret"},
                "signal": {"account": "+1555"},
            },
        });
        let source: OpenClawConfig = serde_json::from_value(raw).unwrap();
        let (cfg, warnings) = convert(&source, Path::new("/nonexistent"));

        assert_eq!(cfg.agents.defaults.model, "openai/gpt-5.2");
        assert_eq!(cfg.agents.defaults.model_name, "gpt-5.2");
        assert_eq!(cfg.agents.defaults.workspace, "~/.picoclaw/workspace");

        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.channels.telegram.token, "tg-token");
        assert_eq!(cfg.channels.telegram.allow_from.0, vec!["123"]);

        assert!(!cfg.channels.whatsapp.enabled);
        assert_eq!(cfg.channels.whatsapp.bridge_url, "ws://127.0.0.1:8055/ws");

        assert_eq!(cfg.channels.dingtalk.client_id, "ding-id");
        assert_eq!(cfg.channels.dingtalk.client_secret, "ding-secret");

        assert!(warnings.iter().any(|w| w.contains("signal")));
    }

    #[test]
    fn missing_model_falls_back_to_default() {
        let (cfg, _) = convert(&OpenClawConfig::default(), Path::new("/nonexistent"));
        assert_eq!(cfg.agents.defaults.model, "anthropic/claude-sonnet-4.6");
        assert_eq!(cfg.model_list.len(), 1);
        assert!(cfg.model_list[0].api_key.is_empty());
    }

    #[test]
    fn detailed_model_shape_is_understood() {
        let raw = serde_json::json!({
            "agents": {"defaults": {"model": {"primary": "claude/claude-opus-4.5"}}},
        });
        let source: OpenClawConfig = serde_json::from_value(raw).unwrap();
        let (cfg, _) = convert(&source, Path::new("/nonexistent"));
        assert_eq!(cfg.agents.defaults.model, "anthropic/claude-opus-4.5");
    }

    #[test]
    fn provider_aliases_are_mapped() {
        assert_eq!(map_provider("claude"), "anthropic");
        assert_eq!(map_provider("GPT"), "openai");
        assert_eq!(map_provider("openrouter"), "openrouter");
    }

    #[test]
    fn unsupported_channels_warn() {
        let raw = serde_json::json!({
            "channels": {
                "matrix": {}, "irc": {}, "mattermost": {},
                "googlechat": {}, "msteams": {}, "imessage": {}, "bluebubbles": {},
            },
        });
        let source: OpenClawConfig = serde_json::from_value(raw).unwrap();
        let (_, warnings) = convert(&source, Path::new("/nonexistent"));
        assert_eq!(warnings.len(), 7);
        assert!(warnings.iter().any(|w| w.contains("googlechat")));
        assert!(warnings.iter().any(|w| w.contains("msteams")));
        assert!(warnings.iter().any(|w| w.contains("macOS-only")));
        assert!(warnings.iter().any(|w| w.contains("bluebubbles")));
    }

    #[test]
    fn provider_credentials_carry_over_from_models_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("agents/main/agent")).unwrap();
        std::fs::write(
            tmp.path().join("agents/main/agent/models.json"),
            serde_json::json!({
                "providers": {
                    "openai": {"apiKey": "sk-openai", "baseUrl": "https://api.openai.com/v1"},
                    "openrouter": {"apiKey": "sk-or"},
                    "ollama": {"baseUrl": "http://localhost:11434"},
                }
            })
            .to_string(),
        )
        .unwrap();

        let raw = serde_json::json!({
            "agents": {"defaults": {"model": "openai/gpt-5.2"}},
        });
        let source: OpenClawConfig = serde_json::from_value(raw).unwrap();
        let (cfg, _) = convert(&source, tmp.path());

        // The selected provider keeps its key and base URL on the default entry.
        assert_eq!(cfg.model_list[0].model, "openai/gpt-5.2");
        assert_eq!(cfg.model_list[0].api_key, "sk-openai");
        assert_eq!(
            cfg.model_list[0].api_base.as_deref(),
            Some("https://api.openai.com/v1")
        );

        // Other providers with stored keys become extra entries; keyless ones
        // are dropped.
        assert_eq!(cfg.model_list.len(), 2);
        assert_eq!(cfg.model_list[1].model, "openrouter/openrouter");
        assert_eq!(cfg.model_list[1].api_key, "sk-or");
        assert!(!cfg.model_list.iter().any(|m| m.model.starts_with("ollama")));
    }
}
