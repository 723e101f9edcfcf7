//! Config patching after login/logout: keep `auth_method` on providers and
//! their models in sync with the credential store.

use crate::config::{self, ModelConfig};
use std::path::Path;

/// Update config.json after a successful provider login: set the provider's
/// auth method, patch the first matching model (or append a default entry),
/// and point the default model at it.
pub fn update_config_after_login(config_path: &Path, provider: &str) {
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("could not load config to update auth_method: {e}");
            return;
        }
    };

    match provider {
        "openai" => {
            cfg.providers.openai.auth_method = Some("oauth".into());
            patch_or_append_model(
                &mut cfg.model_list,
                is_openai_model,
                "oauth",
                "gpt-5.2",
                "openai/gpt-5.2",
            );
            cfg.agents.defaults.model_name = "gpt-5.2".into();
        }
        "anthropic" => {
            cfg.providers.anthropic.auth_method = Some("token".into());
            patch_or_append_model(
                &mut cfg.model_list,
                is_anthropic_model,
                "token",
                "claude-sonnet-4.6",
                "anthropic/claude-sonnet-4.6",
            );
            cfg.agents.defaults.model_name = "claude-sonnet-4.6".into();
        }
        "google-antigravity" | "antigravity" => {
            cfg.providers.antigravity.auth_method = Some("oauth".into());
            patch_or_append_model(
                &mut cfg.model_list,
                is_antigravity_model,
                "oauth",
                "gemini-flash",
                "antigravity/gemini-3-flash",
            );
            cfg.agents.defaults.model_name = "gemini-flash".into();
        }
        _ => return,
    }

    if let Err(e) = config::save_config(config_path, &cfg) {
        tracing::warn!("could not update config after login: {e}");
    }
}

fn patch_or_append_model(
    models: &mut Vec<ModelConfig>,
    matches: fn(&str) -> bool,
    auth_method: &str,
    model_name: &str,
    model: &str,
) {
    if let Some(entry) = models.iter_mut().find(|m| matches(&m.model)) {
        entry.auth_method = Some(auth_method.to_string());
        return;
    }
    models.push(ModelConfig {
        model_name: model_name.to_string(),
        model: model.to_string(),
        auth_method: Some(auth_method.to_string()),
        ..ModelConfig::default()
    });
}

/// Clear auth_method for one provider (models and provider block).
pub fn clear_auth_method_in_config(config_path: &Path, provider: &str) {
    let Ok(mut cfg) = config::load_config(config_path) else {
        return;
    };

    for model in &mut cfg.model_list {
        let clears = match provider {
            "openai" => is_openai_model(&model.model),
            "anthropic" => is_anthropic_model(&model.model),
            "google-antigravity" | "antigravity" => is_antigravity_model(&model.model),
            _ => false,
        };
        if clears {
            model.auth_method = None;
        }
    }

    match provider {
        "openai" => cfg.providers.openai.auth_method = None,
        "anthropic" => cfg.providers.anthropic.auth_method = None,
        "google-antigravity" | "antigravity" => cfg.providers.antigravity.auth_method = None,
        _ => {}
    }

    let _ = config::save_config(config_path, &cfg);
}

/// Clear auth_method everywhere (logout-all).
pub fn clear_all_auth_methods_in_config(config_path: &Path) {
    let Ok(mut cfg) = config::load_config(config_path) else {
        return;
    };
    for model in &mut cfg.model_list {
        model.auth_method = None;
    }
    cfg.providers.openai.auth_method = None;
    cfg.providers.anthropic.auth_method = None;
    cfg.providers.antigravity.auth_method = None;
    let _ = config::save_config(config_path, &cfg);
}

fn is_openai_model(model: &str) -> bool {
    model == "openai" || model.starts_with("openai/")
}

fn is_anthropic_model(model: &str) -> bool {
    model == "anthropic" || model.starts_with("anthropic/")
}

fn is_antigravity_model(model: &str) -> bool {
    model == "antigravity"
        || model == "google-antigravity"
        || model.starts_with("antigravity/")
        || model.starts_with("google-antigravity/")
}
