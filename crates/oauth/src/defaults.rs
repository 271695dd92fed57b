use {modelgate_config::OAuthSection, tracing::debug};

use crate::types::{IdentitySource, ProviderConfig, TokenRequestFormat};

pub const ANTHROPIC: &str = "anthropic";
pub const OPENAI_CODEX: &str = "openai-codex";

/// Built-in provider configurations, in display order.
pub fn builtin_defaults() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            id: ANTHROPIC.into(),
            name: "Anthropic".into(),
            icon: "anthropic".into(),
            description: "Claude models via your Claude Pro or Max subscription".into(),
            authorize_url: "https://claude.ai/oauth/authorize".into(),
            token_url: "https://console.anthropic.com/v1/oauth/token".into(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".into(),
            scopes: vec![
                "org:create_api_key".into(),
                "user:profile".into(),
                "user:inference".into(),
            ],
            redirect_path: "/callback".into(),
            callback_port: None,
            extra_auth_params: vec![("code".into(), "true".into())],
            verifier_bytes: 32,
            token_request_format: TokenRequestFormat::Json,
            exchange_includes_state: true,
            success_redirect_url: Some(
                "https://console.anthropic.com/oauth/code/success?app=claude-code".into(),
            ),
            identity: IdentitySource::ProfileEndpoint {
                url: "https://api.anthropic.com/api/oauth/profile".into(),
                required_scope: Some("user:profile".into()),
            },
        },
        ProviderConfig {
            id: OPENAI_CODEX.into(),
            name: "OpenAI Codex".into(),
            icon: "openai".into(),
            description: "OpenAI models via your ChatGPT subscription".into(),
            authorize_url: "https://auth.openai.com/oauth/authorize".into(),
            token_url: "https://auth.openai.com/oauth/token".into(),
            client_id: "app_EMoamEEZ73f0CkXaXp7hrann".into(),
            scopes: vec![
                "openid".into(),
                "profile".into(),
                "email".into(),
                "offline_access".into(),
            ],
            redirect_path: "/auth/callback".into(),
            callback_port: Some(1455),
            extra_auth_params: vec![
                ("id_token_add_organizations".into(), "true".into()),
                ("codex_cli_simplified_flow".into(), "true".into()),
            ],
            verifier_bytes: 64,
            token_request_format: TokenRequestFormat::Form,
            exchange_includes_state: false,
            success_redirect_url: None,
            identity: IdentitySource::IdTokenClaims {
                namespace: "https://api.openai.com/auth".into(),
                account_field: "chatgpt_account_id".into(),
            },
        },
    ]
}

pub fn builtin_config(id: &str) -> Option<ProviderConfig> {
    builtin_defaults().into_iter().find(|c| c.id == id)
}

/// Load the config for a provider.
///
/// Priority (later wins):
/// 1. Built-in defaults
/// 2. `[oauth.providers.<id>]` in the config file
/// 3. Environment variables (`MODELGATE_OAUTH_{PROVIDER}_CLIENT_ID`, etc.)
///
/// Returns `None` for unknown ids and for providers disabled in config.
pub fn load_provider_config(id: &str, section: &OAuthSection) -> Option<ProviderConfig> {
    if !section.is_enabled(id) {
        debug!(provider = id, "OAuth provider disabled in config");
        return None;
    }
    let mut config = builtin_config(id)?;
    apply_file_overrides(&mut config, section);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Some(config)
}

/// All enabled built-in providers with overrides applied.
pub fn configured_providers(section: &OAuthSection) -> Vec<ProviderConfig> {
    builtin_defaults()
        .into_iter()
        .filter_map(|c| load_provider_config(&c.id, section))
        .collect()
}

fn apply_file_overrides(config: &mut ProviderConfig, section: &OAuthSection) {
    let Some(over) = section.provider(&config.id) else {
        return;
    };
    if let Some(v) = &over.client_id {
        config.client_id.clone_from(v);
    }
    if let Some(v) = &over.authorize_url {
        config.authorize_url.clone_from(v);
    }
    if let Some(v) = &over.token_url {
        config.token_url.clone_from(v);
    }
    if let Some(v) = &over.profile_url {
        set_profile_url(config, v.clone());
    }
    if let Some(port) = over.callback_port {
        config.callback_port = Some(port);
    }
    if let Some(scopes) = &over.scopes {
        config.scopes.clone_from(scopes);
    }
}

fn apply_env_overrides(config: &mut ProviderConfig, lookup: impl Fn(&str) -> Option<String>) {
    let prefix = format!(
        "MODELGATE_OAUTH_{}_",
        config.id.to_uppercase().replace('-', "_")
    );
    if let Some(v) = lookup(&format!("{prefix}CLIENT_ID")) {
        config.client_id = v;
    }
    if let Some(v) = lookup(&format!("{prefix}AUTH_URL")) {
        config.authorize_url = v;
    }
    if let Some(v) = lookup(&format!("{prefix}TOKEN_URL")) {
        config.token_url = v;
    }
    if let Some(v) = lookup(&format!("{prefix}PROFILE_URL")) {
        set_profile_url(config, v);
    }
}

/// Only meaningful for profile-endpoint providers; claim-based identity has
/// no URL to override.
fn set_profile_url(config: &mut ProviderConfig, new_url: String) {
    match &mut config.identity {
        IdentitySource::ProfileEndpoint { url, .. } => *url = new_url,
        IdentitySource::IdTokenClaims { .. } => {
            debug!(provider = %config.id, "ignoring profile_url override for id_token provider");
        },
    }
}
